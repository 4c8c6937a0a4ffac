// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Envelope
//!
//! The JSON body exchanged over the broker in both directions, and the retry
//! metadata carried alongside it in AMQP headers.
//!
//! ```json
//! { "eventType": "user.created", "data": { ... }, "timestamp": "2025-01-01T00:00:00.000Z" }
//! ```
//!
//! Outbound envelopes additionally carry the producing `service`.

use crate::errors::HandlerError;
use chrono::{DateTime, SecondsFormat, Utc};
use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Header carrying the number of times a message went through the retry path
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Header carrying the last failure when a message is dead-lettered
pub const AMQP_HEADERS_FAILED_REASON: &str = "x-failed-reason";
/// Header carrying the dead-lettering instant (RFC 3339)
pub const AMQP_HEADERS_FAILED_AT: &str = "x-failed-at";

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default = "now_iso")]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl EventEnvelope {
    /// Builds an outbound envelope stamped with the current time.
    pub fn outbound(event_type: &str, data: Map<String, Value>, service: &str) -> EventEnvelope {
        EventEnvelope {
            event_type: event_type.to_owned(),
            data,
            timestamp: iso_timestamp(Utc::now()),
            service: Some(service.to_owned()),
        }
    }

    /// Decodes a message body. Only a body that is not a JSON object with an
    /// object `data` fails; an absent or unknown `eventType` is left for the
    /// dispatcher to ignore.
    pub fn decode(body: &[u8]) -> Result<EventEnvelope, HandlerError> {
        serde_json::from_slice(body).map_err(|err| HandlerError::Decode(err.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Reads a string field from `data`.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Millisecond precision, `Z` suffix.
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn now_iso() -> String {
    iso_timestamp(Utc::now())
}

/// Retry bookkeeping carried in the headers of an in-flight message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryMetadata {
    pub retry_count: u32,
    pub failed_reason: Option<String>,
    pub failed_at: Option<String>,
}

impl RetryMetadata {
    /// Reads the metadata from message headers. Absent or unreadable values
    /// count as zero retries.
    pub fn from_headers(headers: Option<&FieldTable>) -> RetryMetadata {
        let Some(headers) = headers else {
            return RetryMetadata::default();
        };
        let inner = headers.inner();

        RetryMetadata {
            retry_count: inner
                .get(AMQP_HEADERS_RETRY_COUNT)
                .and_then(as_count)
                .unwrap_or_default(),
            failed_reason: inner.get(AMQP_HEADERS_FAILED_REASON).and_then(as_string),
            failed_at: inner.get(AMQP_HEADERS_FAILED_AT).and_then(as_string),
        }
    }

    /// Metadata for the next trip through the retry queue.
    pub fn next_attempt(&self) -> RetryMetadata {
        RetryMetadata {
            retry_count: self.retry_count.saturating_add(1),
            failed_reason: None,
            failed_at: None,
        }
    }

    /// Metadata stamped on a message moved to the dead-letter queue.
    pub fn exhausted(&self, reason: &str, at: DateTime<Utc>) -> RetryMetadata {
        RetryMetadata {
            retry_count: self.retry_count,
            failed_reason: Some(reason.to_owned()),
            failed_at: Some(iso_timestamp(at)),
        }
    }

    /// Returns `headers` with this metadata written over any previous values.
    pub fn apply(&self, headers: Option<&FieldTable>) -> FieldTable {
        let mut btree: BTreeMap<ShortString, AMQPValue> = headers
            .map(|h| h.inner().clone())
            .unwrap_or_default();

        btree.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongLongInt(LongLongInt::from(self.retry_count)),
        );

        match &self.failed_reason {
            Some(reason) => btree.insert(
                ShortString::from(AMQP_HEADERS_FAILED_REASON),
                AMQPValue::LongString(LongString::from(reason.clone())),
            ),
            None => btree.remove(AMQP_HEADERS_FAILED_REASON),
        };

        match &self.failed_at {
            Some(at) => btree.insert(
                ShortString::from(AMQP_HEADERS_FAILED_AT),
                AMQPValue::LongString(LongString::from(at.clone())),
            ),
            None => btree.remove(AMQP_HEADERS_FAILED_AT),
        };

        FieldTable::from(btree)
    }
}

fn as_count(value: &AMQPValue) -> Option<u32> {
    let count: i64 = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok()?.trim().parse().ok()?,
        AMQPValue::ShortString(v) => v.as_str().trim().parse().ok()?,
        _ => return None,
    };

    u32::try_from(count.max(0)).ok()
}

fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok().map(str::to_owned),
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn headers(pairs: Vec<(&str, AMQPValue)>) -> FieldTable {
        let mut btree = BTreeMap::new();
        for (k, v) in pairs {
            btree.insert(ShortString::from(k), v);
        }
        FieldTable::from(btree)
    }

    #[test]
    fn decodes_inbound_envelope() {
        let body = json!({
            "eventType": "user.created",
            "data": { "userId": "u1", "email": "a@b.c" },
            "timestamp": "2025-01-01T00:00:00.000Z"
        })
        .to_string();

        let envelope = EventEnvelope::decode(body.as_bytes()).unwrap();
        assert_eq!(envelope.event_type, "user.created");
        assert_eq!(envelope.data_str("userId"), Some("u1"));
        assert_eq!(envelope.service, None);
    }

    #[test]
    fn rejects_malformed_bodies() {
        assert!(matches!(
            EventEnvelope::decode(b"not json"),
            Err(HandlerError::Decode(_))
        ));
        assert!(matches!(
            EventEnvelope::decode(br#"["user.created"]"#),
            Err(HandlerError::Decode(_))
        ));
        assert!(matches!(
            EventEnvelope::decode(br#"{"eventType":"user.created","data":"u1"}"#),
            Err(HandlerError::Decode(_))
        ));
    }

    #[test]
    fn keeps_unusual_event_types_for_the_dispatcher() {
        let missing = EventEnvelope::decode(br#"{"data":{"userId":"u1"}}"#).unwrap();
        assert_eq!(missing.event_type, "");
        assert_eq!(missing.data_str("userId"), Some("u1"));

        let flat = EventEnvelope::decode(br#"{"eventType":"heartbeat"}"#).unwrap();
        assert_eq!(flat.event_type, "heartbeat");
        assert!(flat.data.is_empty());

        let nested =
            EventEnvelope::decode(br#"{"eventType":"auth.user.created","data":{}}"#).unwrap();
        assert_eq!(nested.event_type, "auth.user.created");
    }

    #[test]
    fn missing_timestamp_defaults_to_now() {
        let before = Utc::now();
        let envelope = EventEnvelope::decode(br#"{"eventType":"user.created"}"#).unwrap();

        let stamped = DateTime::parse_from_rfc3339(&envelope.timestamp)
            .unwrap()
            .with_timezone(&Utc);
        assert!(envelope.timestamp.ends_with('Z'));
        assert!(stamped >= before - chrono::Duration::milliseconds(1));
        assert!(stamped <= Utc::now());
    }

    #[test]
    fn outbound_envelope_serializes_camel_case_with_service() {
        let mut data = Map::new();
        data.insert("companyId".to_owned(), json!("c1"));
        let envelope = EventEnvelope::outbound("company.created", data, "company-service");

        let value: Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["eventType"], "company.created");
        assert_eq!(value["service"], "company-service");
        assert_eq!(value["data"]["companyId"], "c1");
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn retry_count_defaults_to_zero() {
        assert_eq!(RetryMetadata::from_headers(None).retry_count, 0);
        assert_eq!(
            RetryMetadata::from_headers(Some(&FieldTable::default())).retry_count,
            0
        );
        let negative = headers(vec![(AMQP_HEADERS_RETRY_COUNT, AMQPValue::LongInt(-4))]);
        assert_eq!(RetryMetadata::from_headers(Some(&negative)).retry_count, 0);
    }

    #[test]
    fn retry_count_reads_any_integer_encoding() {
        let long = headers(vec![(AMQP_HEADERS_RETRY_COUNT, AMQPValue::LongLongInt(2))]);
        let short = headers(vec![(AMQP_HEADERS_RETRY_COUNT, AMQPValue::ShortShortUInt(1))]);
        let text = headers(vec![(
            AMQP_HEADERS_RETRY_COUNT,
            AMQPValue::LongString(LongString::from("3")),
        )]);

        assert_eq!(RetryMetadata::from_headers(Some(&long)).retry_count, 2);
        assert_eq!(RetryMetadata::from_headers(Some(&short)).retry_count, 1);
        assert_eq!(RetryMetadata::from_headers(Some(&text)).retry_count, 3);
    }

    #[test]
    fn apply_increments_and_preserves_other_headers() {
        let original = headers(vec![
            ("traceparent", AMQPValue::LongString(LongString::from("00-abc"))),
            (AMQP_HEADERS_RETRY_COUNT, AMQPValue::LongLongInt(1)),
        ]);

        let meta = RetryMetadata::from_headers(Some(&original)).next_attempt();
        let applied = meta.apply(Some(&original));

        assert_eq!(RetryMetadata::from_headers(Some(&applied)).retry_count, 2);
        assert!(applied.inner().contains_key("traceparent"));
        assert!(!applied.inner().contains_key(AMQP_HEADERS_FAILED_REASON));
    }

    #[test]
    fn exhausted_metadata_round_trips_through_headers() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let meta = RetryMetadata {
            retry_count: 3,
            ..RetryMetadata::default()
        }
        .exhausted("service failure: boom", at);

        let read = RetryMetadata::from_headers(Some(&meta.apply(None)));
        assert_eq!(read.retry_count, 3);
        assert_eq!(read.failed_reason.as_deref(), Some("service failure: boom"));
        assert_eq!(read.failed_at.as_deref(), Some("2025-03-01T12:00:00.000Z"));
    }
}
