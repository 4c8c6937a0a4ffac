// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Company Collaborator
//!
//! The event layer does not own company storage. It calls a `CompanyService`
//! with typed inputs and gets a `Company` snapshot back. `InMemoryCompanyService`
//! is a process-local implementation used by the bundled binary and tests.

use crate::errors::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Mutex};
use tracing::{info, warn};
use uuid::Uuid;

/// Snapshot of a company record as seen by the event layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Company {
    pub id: String,
    pub name: String,
    pub email: String,
    pub registration_number: Option<String>,
    pub eik: Option<String>,
    pub vat_number: Option<String>,
    pub phone: Option<String>,
    pub address: Address,
    pub created_by: String,
    pub is_verified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub street: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

/// `data` of a `user.created` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreatedPayload {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub company: Option<CompanyDetails>,
    #[serde(default)]
    pub contact: Option<ContactDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyDetails {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub registration_number: Option<String>,
    #[serde(default)]
    pub eik: Option<String>,
    #[serde(default)]
    pub vat_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactDetails {
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

/// Business operations invoked by the inbound event handlers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompanyService: Send + Sync {
    /// Creates the company owned by `payload.user_id`. A second call for the
    /// same owner returns the existing record unchanged.
    async fn create_from_auth_event(
        &self,
        payload: &UserCreatedPayload,
    ) -> Result<Company, ServiceError>;

    /// Marks the company owned by `user_id` as verified. `Ok(None)` when the
    /// owner has no company.
    async fn update_email_verified(&self, user_id: &str) -> Result<Option<Company>, ServiceError>;
}

/// Company records keyed by owner id.
#[derive(Default)]
pub struct InMemoryCompanyService {
    companies: Mutex<HashMap<String, Company>>,
}

impl InMemoryCompanyService {
    pub fn new() -> InMemoryCompanyService {
        InMemoryCompanyService::default()
    }

    pub fn find_by_owner(&self, user_id: &str) -> Option<Company> {
        self.companies
            .lock()
            .ok()
            .and_then(|companies| companies.get(user_id).cloned())
    }

    pub fn len(&self) -> usize {
        self.companies.lock().map(|c| c.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CompanyService for InMemoryCompanyService {
    async fn create_from_auth_event(
        &self,
        payload: &UserCreatedPayload,
    ) -> Result<Company, ServiceError> {
        let mut companies = self
            .companies
            .lock()
            .map_err(|_| ServiceError("company store poisoned".to_owned()))?;

        if let Some(existing) = companies.get(&payload.user_id) {
            warn!(user_id = payload.user_id, "company already exists for user");
            return Ok(existing.clone());
        }

        let details = payload.company.clone().unwrap_or_default();
        let contact = payload.contact.clone().unwrap_or_default();

        let Some(name) = details.name.clone() else {
            return Err(ServiceError("company name is required".to_owned()));
        };

        let company = Company {
            id: Uuid::new_v4().to_string(),
            name,
            email: payload.email.clone().unwrap_or_default(),
            registration_number: details.registration_number,
            eik: details.eik,
            vat_number: details.vat_number,
            phone: contact.phone,
            address: Address {
                street: contact.address,
                city: contact.city,
                postal_code: contact.postal_code,
                country: contact.country,
            },
            created_by: payload.user_id.clone(),
            is_verified: false,
        };

        companies.insert(payload.user_id.clone(), company.clone());
        info!(
            company_id = company.id,
            user_id = payload.user_id,
            "company created from auth event"
        );

        Ok(company)
    }

    async fn update_email_verified(&self, user_id: &str) -> Result<Option<Company>, ServiceError> {
        let mut companies = self
            .companies
            .lock()
            .map_err(|_| ServiceError("company store poisoned".to_owned()))?;

        let Some(company) = companies.get_mut(user_id) else {
            warn!(user_id, "company not found for email verification");
            return Ok(None);
        };

        company.is_verified = true;
        info!(company_id = company.id, user_id, "company email verified");

        Ok(Some(company.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(user_id: &str) -> UserCreatedPayload {
        UserCreatedPayload {
            user_id: user_id.to_owned(),
            email: Some("owner@acme.test".to_owned()),
            company: Some(CompanyDetails {
                name: Some("Acme".to_owned()),
                registration_number: Some("RN-1".to_owned()),
                ..CompanyDetails::default()
            }),
            contact: Some(ContactDetails {
                city: Some("Sofia".to_owned()),
                ..ContactDetails::default()
            }),
        }
    }

    #[tokio::test]
    async fn creation_is_idempotent_per_owner() {
        let service = InMemoryCompanyService::new();

        let first = service.create_from_auth_event(&payload("u1")).await.unwrap();
        let second = service.create_from_auth_event(&payload("u1")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(service.len(), 1);
        assert_eq!(first.address.city.as_deref(), Some("Sofia"));
        assert_eq!(first.created_by, "u1");
        assert!(!first.is_verified);
    }

    #[tokio::test]
    async fn creation_requires_a_company_name() {
        let service = InMemoryCompanyService::new();
        let mut input = payload("u2");
        input.company = None;

        assert!(service.create_from_auth_event(&input).await.is_err());
        assert!(service.is_empty());
    }

    #[tokio::test]
    async fn verification_of_unknown_owner_is_a_no_op() {
        let service = InMemoryCompanyService::new();
        assert_eq!(service.update_email_verified("nobody").await, Ok(None));
    }

    #[tokio::test]
    async fn verification_marks_company() {
        let service = InMemoryCompanyService::new();
        service.create_from_auth_event(&payload("u3")).await.unwrap();

        let verified = service.update_email_verified("u3").await.unwrap();
        assert!(verified.map(|c| c.is_verified).unwrap_or(false));
        assert!(service.find_by_owner("u3").unwrap().is_verified);
    }
}
