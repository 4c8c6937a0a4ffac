// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Inbound Event Handlers
//!
//! A handler turns one decoded envelope into a call on the company
//! collaborator. Handlers never acknowledge anything themselves; the consumer
//! decides what happens to the delivery from the returned `Result`.

use crate::{
    company::{CompanyService, UserCreatedPayload},
    envelope::EventEnvelope,
    errors::HandlerError,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub const USER_CREATED: &str = "user.created";
pub const USER_EMAIL_VERIFIED: &str = "user.email_verified";

/// Processes envelopes of one event type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

fn require_user_id(envelope: &EventEnvelope) -> Result<&str, HandlerError> {
    envelope
        .data_str("userId")
        .filter(|id| !id.is_empty())
        .ok_or(HandlerError::MissingField("userId"))
}

/// `user.created`: creates the company owned by the new user.
pub struct UserCreatedHandler {
    service: Arc<dyn CompanyService>,
}

impl UserCreatedHandler {
    pub fn new(service: Arc<dyn CompanyService>) -> Arc<UserCreatedHandler> {
        Arc::new(UserCreatedHandler { service })
    }
}

#[async_trait]
impl EventHandler for UserCreatedHandler {
    async fn exec(&self, _ctx: &Context, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let user_id = require_user_id(envelope)?;
        info!(user_id, "processing user.created event");

        let payload: UserCreatedPayload =
            serde_json::from_value(Value::Object(envelope.data.clone()))
                .map_err(|err| HandlerError::Decode(err.to_string()))?;

        let company = self.service.create_from_auth_event(&payload).await?;
        info!(
            user_id,
            company_id = company.id,
            "company created from auth event"
        );

        Ok(())
    }
}

/// `user.email_verified`: marks the user's company as verified.
pub struct EmailVerifiedHandler {
    service: Arc<dyn CompanyService>,
}

impl EmailVerifiedHandler {
    pub fn new(service: Arc<dyn CompanyService>) -> Arc<EmailVerifiedHandler> {
        Arc::new(EmailVerifiedHandler { service })
    }
}

#[async_trait]
impl EventHandler for EmailVerifiedHandler {
    async fn exec(&self, _ctx: &Context, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let user_id = require_user_id(envelope)?;
        info!(user_id, "processing user.email_verified event");

        match self.service.update_email_verified(user_id).await? {
            Some(company) => info!(user_id, company_id = company.id, "company email verified"),
            None => info!(user_id, "no company to verify, skipping"),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        company::{Company, MockCompanyService},
        errors::ServiceError,
    };
    use serde_json::json;

    fn envelope(event_type: &str, data: Value) -> EventEnvelope {
        EventEnvelope {
            event_type: event_type.to_owned(),
            data: data.as_object().cloned().unwrap_or_default(),
            timestamp: "2025-01-01T00:00:00.000Z".to_owned(),
            service: None,
        }
    }

    #[tokio::test]
    async fn user_created_forwards_typed_payload() {
        let mut service = MockCompanyService::new();
        service
            .expect_create_from_auth_event()
            .withf(|payload: &UserCreatedPayload| {
                payload.user_id == "u1"
                    && payload.email.as_deref() == Some("a@b.c")
                    && payload.company.as_ref().and_then(|c| c.name.as_deref()) == Some("Acme")
            })
            .times(1)
            .returning(|_| {
                Ok(Company {
                    id: "c1".to_owned(),
                    ..Company::default()
                })
            });

        let handler = UserCreatedHandler::new(Arc::new(service));
        let env = envelope(
            USER_CREATED,
            json!({ "userId": "u1", "email": "a@b.c", "company": { "name": "Acme" } }),
        );

        assert_eq!(handler.exec(&Context::new(), &env).await, Ok(()));
    }

    #[tokio::test]
    async fn user_created_without_user_id_fails() {
        let mut service = MockCompanyService::new();
        service.expect_create_from_auth_event().times(0);

        let handler = UserCreatedHandler::new(Arc::new(service));
        let env = envelope(USER_CREATED, json!({ "email": "a@b.c" }));

        assert_eq!(
            handler.exec(&Context::new(), &env).await,
            Err(HandlerError::MissingField("userId"))
        );
    }

    #[tokio::test]
    async fn user_created_with_malformed_data_is_a_decode_failure() {
        let mut service = MockCompanyService::new();
        service.expect_create_from_auth_event().times(0);

        let handler = UserCreatedHandler::new(Arc::new(service));
        let env = envelope(USER_CREATED, json!({ "userId": "u1", "company": "Acme" }));

        assert!(matches!(
            handler.exec(&Context::new(), &env).await,
            Err(HandlerError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn service_failures_propagate() {
        let mut service = MockCompanyService::new();
        service
            .expect_update_email_verified()
            .returning(|_| Err(ServiceError("db down".to_owned())));

        let handler = EmailVerifiedHandler::new(Arc::new(service));
        let env = envelope(USER_EMAIL_VERIFIED, json!({ "userId": "u1" }));

        assert_eq!(
            handler.exec(&Context::new(), &env).await,
            Err(HandlerError::Service("db down".to_owned()))
        );
    }

    #[tokio::test]
    async fn email_verified_without_company_is_a_no_op() {
        let mut service = MockCompanyService::new();
        service
            .expect_update_email_verified()
            .withf(|user_id: &str| user_id == "u1")
            .times(1)
            .returning(|_| Ok(None));

        let handler = EmailVerifiedHandler::new(Arc::new(service));
        let env = envelope(USER_EMAIL_VERIFIED, json!({ "userId": "u1" }));

        assert_eq!(handler.exec(&Context::new(), &env).await, Ok(()));
    }
}
