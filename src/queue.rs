// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Builder-style description of queues and queue bindings. A queue may carry
//! a message TTL and a dead-letter target; together they implement the
//! delayed redelivery used by the retry queue.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::{collections::BTreeMap, time::Duration};

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with standard settings
    /// (non-durable, no TTL).
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the message Time-To-Live for the queue. Sub-millisecond parts
    /// are dropped and values beyond `i32::MAX` ms saturate.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(i32::try_from(ttl.as_millis()).unwrap_or(i32::MAX));
        self
    }

    /// Routes expired or rejected messages to `routing_key` on `exchange`.
    ///
    /// Passing the default exchange (`""`) with a queue name as the key
    /// delivers straight into that queue.
    pub fn dead_letter_to(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    /// Declaration arguments derived from the definition.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.clone())),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        FieldTable::from(args)
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding<'qeb> {
    pub(crate) queue_name: &'qeb str,
    pub(crate) exchange_name: &'qeb str,
    pub(crate) routing_key: &'qeb str,
}

impl<'qeb> QueueBinding<'qeb> {
    /// Creates a new queue binding for the given queue. The exchange name and
    /// routing key default to empty strings.
    pub fn new(queue: &'qeb str) -> QueueBinding<'qeb> {
        QueueBinding {
            queue_name: queue,
            exchange_name: "",
            routing_key: "",
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &'qeb str) -> Self {
        self.exchange_name = exchange;
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &'qeb str) -> Self {
        self.routing_key = key;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_queue_has_no_arguments() {
        let def = QueueDefinition::new("company_service_queue").durable();
        assert!(def.durable);
        assert!(def.arguments().inner().is_empty());
    }

    #[test]
    fn retry_queue_arguments_dead_letter_back_to_main_queue() {
        let def = QueueDefinition::new("company_service_queue.retry")
            .durable()
            .ttl(Duration::from_secs(5))
            .dead_letter_to("", "company_service_queue");

        let args = def.arguments();
        let inner = args.inner();

        assert_eq!(
            inner.get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongInt(5000))
        );
        assert_eq!(
            inner.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("")))
        );
        assert_eq!(
            inner.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from("company_service_queue")))
        );
    }

    #[test]
    fn oversized_ttl_saturates() {
        let def = QueueDefinition::new("q").ttl(Duration::from_secs(u64::MAX / 1000));
        assert_eq!(def.ttl, Some(i32::MAX));
    }

    #[test]
    fn binding_builder() {
        let binding = QueueBinding::new("company_service_queue")
            .exchange("auth_events")
            .routing_key("user.*");
        assert_eq!(binding.queue_name, "company_service_queue");
        assert_eq!(binding.exchange_name, "auth_events");
        assert_eq!(binding.routing_key, "user.*");
    }
}
