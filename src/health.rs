// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Readiness report for the host's health endpoint. The broker check is
//! driven solely by `EventSubscriber::is_ready`.

use crate::{envelope::iso_timestamp, subscriber::EventSubscriber};
use chrono::Utc;
use serde::Serialize;

pub const HTTP_OK: u16 = 200;
pub const HTTP_SERVICE_UNAVAILABLE: u16 = 503;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessStatus {
    Ready,
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerCheck {
    pub status: CheckStatus,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessChecks {
    pub rabbitmq: BrokerCheck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessReport {
    pub status: ReadinessStatus,
    pub timestamp: String,
    pub checks: ReadinessChecks,
}

impl ReadinessReport {
    pub fn new(broker_ready: bool) -> ReadinessReport {
        ReadinessReport {
            status: if broker_ready {
                ReadinessStatus::Ready
            } else {
                ReadinessStatus::NotReady
            },
            timestamp: iso_timestamp(Utc::now()),
            checks: ReadinessChecks {
                rabbitmq: BrokerCheck {
                    status: if broker_ready {
                        CheckStatus::Up
                    } else {
                        CheckStatus::Down
                    },
                    connected: broker_ready,
                },
            },
        }
    }

    pub fn from_subscriber(subscriber: &EventSubscriber) -> ReadinessReport {
        ReadinessReport::new(subscriber.is_ready())
    }

    pub fn is_ready(&self) -> bool {
        self.status == ReadinessStatus::Ready
    }

    pub fn http_status(&self) -> u16 {
        if self.is_ready() {
            HTTP_OK
        } else {
            HTTP_SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::AmqpConnection, company::MockCompanyService, dispatcher::Dispatcher};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn ready_report_serializes_as_up() {
        let report = ReadinessReport::new(true);

        assert_eq!(report.http_status(), 200);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], "ready");
        assert_eq!(
            value["checks"],
            json!({ "rabbitmq": { "status": "up", "connected": true } })
        );
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn not_ready_report_maps_to_503() {
        let report = ReadinessReport::new(false);

        assert_eq!(report.http_status(), 503);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], "not_ready");
        assert_eq!(value["checks"]["rabbitmq"]["status"], "down");
        assert_eq!(value["checks"]["rabbitmq"]["connected"], false);
    }

    #[tokio::test]
    async fn idle_subscriber_is_not_ready() {
        let subscriber = EventSubscriber::new(
            None,
            Arc::new(AmqpConnection::new("test-subscriber")),
            Dispatcher::for_company_service(Arc::new(MockCompanyService::new())),
        );
        subscriber.start().await.unwrap();

        let report = ReadinessReport::from_subscriber(&subscriber);
        assert!(!report.is_ready());
        assert_eq!(report.http_status(), 503);
    }
}
