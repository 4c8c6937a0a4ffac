// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Dispatcher
//!
//! Maps an envelope's `eventType` to the handler registered for it. The
//! registry is built once before the subscriber starts and is shared
//! read-only with the consume loop afterwards.

use crate::{
    company::CompanyService,
    handler::{EmailVerifiedHandler, EventHandler, UserCreatedHandler, USER_CREATED, USER_EMAIL_VERIFIED},
    topology::binding_matches,
};
use std::{collections::HashMap, sync::Arc};
use tracing::warn;

#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    /// The dispatcher wired with both inbound company handlers.
    pub fn for_company_service(service: Arc<dyn CompanyService>) -> Dispatcher {
        Dispatcher::new()
            .register(USER_CREATED, UserCreatedHandler::new(service.clone()))
            .register(USER_EMAIL_VERIFIED, EmailVerifiedHandler::new(service))
    }

    /// Registers `handler` for `event_type`, replacing any previous one.
    pub fn register(mut self, event_type: &str, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(event_type.to_owned(), handler);
        self
    }

    pub fn handler(&self, event_type: &str) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(event_type)
    }

    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Event types with a handler that the binding key would never route to
    /// the main queue.
    pub fn unreachable(&self, binding_key: &str) -> Vec<&str> {
        let unreachable: Vec<&str> = self
            .event_types()
            .into_iter()
            .filter(|event_type| !binding_matches(binding_key, event_type))
            .collect();

        for event_type in &unreachable {
            warn!(
                event_type,
                binding_key, "handler registered for an event type the binding does not route"
            );
        }

        unreachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::company::MockCompanyService;

    #[test]
    fn company_dispatcher_covers_both_events() {
        let dispatcher = Dispatcher::for_company_service(Arc::new(MockCompanyService::new()));

        assert_eq!(dispatcher.event_types(), vec!["user.created", "user.email_verified"]);
        assert!(dispatcher.handler("user.created").is_some());
        assert!(dispatcher.handler("user.deleted").is_none());
    }

    #[test]
    fn handlers_are_reachable_through_the_default_binding() {
        let dispatcher = Dispatcher::for_company_service(Arc::new(MockCompanyService::new()));

        assert!(dispatcher.unreachable("user.*").is_empty());
        assert_eq!(
            dispatcher.unreachable("auth.user.*"),
            vec!["user.created", "user.email_verified"]
        );
    }
}
