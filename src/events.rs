// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Company Domain Events
//!
//! Builds the outbound `company.*` envelopes and hands them to a `Publisher`.
//! Nothing here can fail from the caller's point of view.

use crate::{
    company::{Company, CompanyService, UserCreatedPayload},
    envelope::{iso_timestamp, EventEnvelope},
    errors::ServiceError,
    publisher::Publisher,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

pub const COMPANY_CREATED: &str = "company.created";
pub const COMPANY_UPDATED: &str = "company.updated";
pub const COMPANY_DELETED: &str = "company.deleted";

pub struct CompanyEvents {
    publisher: Arc<dyn Publisher>,
    service: String,
}

impl CompanyEvents {
    /// `service` is stamped on every envelope as the producer name.
    pub fn new(publisher: Arc<dyn Publisher>, service: &str) -> CompanyEvents {
        CompanyEvents {
            publisher,
            service: service.to_owned(),
        }
    }

    pub fn created(&self, company: &Company) -> EventEnvelope {
        let mut data = base_data(company);
        data.insert(
            "registrationNumber".to_owned(),
            json!(company.registration_number),
        );
        data.insert("createdBy".to_owned(), json!(company.created_by));
        self.envelope(COMPANY_CREATED, data)
    }

    pub fn updated(&self, company: &Company, updated_fields: &[&str]) -> EventEnvelope {
        let mut data = base_data(company);
        data.insert("updatedFields".to_owned(), json!(updated_fields));
        self.envelope(COMPANY_UPDATED, data)
    }

    pub fn deleted(&self, company: &Company) -> EventEnvelope {
        self.envelope(COMPANY_DELETED, base_data(company))
    }

    pub async fn publish_created(&self, company: &Company) {
        self.publisher
            .publish(COMPANY_CREATED, &self.created(company))
            .await;
        info!(company_id = company.id, "published company.created event");
    }

    pub async fn publish_updated(&self, company: &Company, updated_fields: &[&str]) {
        self.publisher
            .publish(COMPANY_UPDATED, &self.updated(company, updated_fields))
            .await;
        info!(
            company_id = company.id,
            updated_fields = ?updated_fields,
            "published company.updated event"
        );
    }

    pub async fn publish_deleted(&self, company: &Company) {
        self.publisher
            .publish(COMPANY_DELETED, &self.deleted(company))
            .await;
        info!(company_id = company.id, "published company.deleted event");
    }

    fn envelope(&self, event_type: &str, data: Map<String, Value>) -> EventEnvelope {
        EventEnvelope::outbound(event_type, data, &self.service)
    }
}

/// Wraps a `CompanyService` and announces every successful change on the
/// outbound exchange. Delivery is at-least-once: a redelivered `user.created`
/// announces the (unchanged) company again.
pub struct PublishingCompanyService<S> {
    inner: S,
    events: CompanyEvents,
}

impl<S: CompanyService> PublishingCompanyService<S> {
    pub fn new(inner: S, events: CompanyEvents) -> PublishingCompanyService<S> {
        PublishingCompanyService { inner, events }
    }
}

#[async_trait]
impl<S: CompanyService> CompanyService for PublishingCompanyService<S> {
    async fn create_from_auth_event(
        &self,
        payload: &UserCreatedPayload,
    ) -> Result<Company, ServiceError> {
        let company = self.inner.create_from_auth_event(payload).await?;
        self.events.publish_created(&company).await;
        Ok(company)
    }

    async fn update_email_verified(&self, user_id: &str) -> Result<Option<Company>, ServiceError> {
        let company = self.inner.update_email_verified(user_id).await?;
        if let Some(company) = &company {
            self.events.publish_updated(company, &["isVerified"]).await;
        }
        Ok(company)
    }
}

fn base_data(company: &Company) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("companyId".to_owned(), json!(company.id));
    data.insert("name".to_owned(), json!(company.name));
    data.insert("email".to_owned(), json!(company.email));
    data.insert("timestamp".to_owned(), json!(iso_timestamp(Utc::now())));
    data
}
