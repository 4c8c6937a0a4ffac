// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the exchanges, queues and bindings the service relies
//! on. Declarations are installed strictly in registration order so that a
//! dead-letter target always exists before the queue pointing at it.
//!
//! The main components are:
//! - `Topology` trait: ordered registration of declarations plus installation
//! - `AmqpTopology`: implementation that talks to a live channel
//! - `EventTopology`: the one fixed topology of this service
//!
//! Re-installing an identical durable topology is a no-op on the broker, so
//! the subscriber re-runs it after every reconnect. A declaration the broker
//! rejects with `PRECONDITION_FAILED` means an entity already exists with
//! different parameters and is reported as `AmqpError::TopologyConflict`.

use crate::{
    configs::RETRY_DELAY,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::FieldTable,
    Channel,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

pub const INBOUND_EXCHANGE: &str = "auth_events";
pub const INBOUND_BINDING_KEY: &str = "user.*";
pub const MAIN_QUEUE: &str = "company_service_queue";
pub const RETRY_EXCHANGE: &str = "company_service.retry";
pub const RETRY_QUEUE: &str = "company_service_queue.retry";
pub const DEAD_LETTER_QUEUE: &str = "company_service_queue.dlq";
pub const OUTBOUND_EXCHANGE: &str = "company_events";

/// A single entry of an ordered topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration<'tp> {
    Exchange(&'tp ExchangeDefinition<'tp>),
    Queue(&'tp QueueDefinition),
    Binding(&'tp QueueBinding<'tp>),
}

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology<'tp>: Sized {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition<'tp>) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: &'tp QueueBinding<'tp>) -> Self;

    /// Limits the number of unacknowledged deliveries on the channel.
    fn qos(self, prefetch: u16) -> Self;

    /// Installs the topology to the RabbitMQ server.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology<'tp> {
    channel: Arc<Channel>,
    pub(crate) declarations: Vec<Declaration<'tp>>,
    pub(crate) prefetch: Option<u16>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: Arc<Channel>) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            declarations: vec![],
            prefetch: None,
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition<'tp>) -> Self {
        self.declarations.push(Declaration::Exchange(def));
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.declarations.push(Declaration::Queue(def));
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding<'tp>) -> Self {
        self.declarations.push(Declaration::Binding(binding));
        self
    }

    fn qos(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// Declares every registered entity in order, then applies the prefetch
    /// limit.
    async fn install(&self) -> Result<(), AmqpError> {
        for declaration in &self.declarations {
            match declaration {
                Declaration::Exchange(def) => self.install_exchange(def).await?,
                Declaration::Queue(def) => self.install_queue(def).await?,
                Declaration::Binding(binding) => self.binding_queue(binding).await?,
            }
        }

        if let Some(prefetch) = self.prefetch {
            if let Err(err) = self
                .channel
                .basic_qos(prefetch, BasicQosOptions { global: false })
                .await
            {
                error!(error = err.to_string(), "failure to configure qos");
                return Err(AmqpError::QoSDeclarationError(err.to_string()));
            }
            debug!(prefetch, "qos configured");
        }

        Ok(())
    }
}

impl AmqpTopology<'_> {
    async fn install_exchange(&self, exch: &ExchangeDefinition<'_>) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", exch.name);

        match self
            .channel
            .exchange_declare(
                exch.name,
                exch.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: exch.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = exch.name,
                    "error to declare the exchange"
                );
                Err(classify(&err, exch.name, AmqpError::DeclareExchangeError))
            }
            _ => {
                debug!("exchange: {} was created", exch.name);
                Ok(())
            }
        }
    }

    async fn install_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the queue"
                );
                Err(classify(&err, &def.name, AmqpError::DeclareQueueError))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn binding_queue(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                binding.queue_name,
                binding.exchange_name,
                binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.to_owned(),
                    binding.queue_name.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Maps a declaration failure to either a fatal conflict or the transient
/// error built by `fallback`.
fn classify(err: &lapin::Error, name: &str, fallback: fn(String) -> AmqpError) -> AmqpError {
    if is_precondition_failed(err) {
        return AmqpError::TopologyConflict(name.to_owned());
    }
    fallback(name.to_owned())
}

fn is_precondition_failed(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED))
    )
}

/// Topic-exchange routing: `*` matches exactly one word, `#` zero or more.
pub fn binding_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && matches_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && matches_words(rest, &key[1..]),
    }
}

/// Owned definitions of the service topology.
///
/// Kept separate from `EventTopology` so the borrowed declarations handed to
/// a `Topology` live long enough.
pub struct EventDefinitions {
    main_exchange: ExchangeDefinition<'static>,
    retry_exchange: ExchangeDefinition<'static>,
    retry_queue: QueueDefinition,
    retry_binding: QueueBinding<'static>,
    dead_letter_queue: QueueDefinition,
    main_queue: QueueDefinition,
    main_binding: QueueBinding<'static>,
}

/// Names and parameters of the inbound topology owned by the subscriber:
///
/// ```text
/// auth_events (topic) --user.*--> company_service_queue
/// company_service.retry (direct) --company_service_queue--> company_service_queue.retry
///     (ttl) --dead-letter via ""--> company_service_queue
/// company_service_queue.dlq (terminal)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTopology {
    pub exchange: &'static str,
    pub binding_key: &'static str,
    pub queue: &'static str,
    pub retry_exchange: &'static str,
    pub retry_queue: &'static str,
    pub dead_letter_queue: &'static str,
    pub retry_delay: Duration,
    pub prefetch: u16,
}

impl Default for EventTopology {
    fn default() -> Self {
        EventTopology {
            exchange: INBOUND_EXCHANGE,
            binding_key: INBOUND_BINDING_KEY,
            queue: MAIN_QUEUE,
            retry_exchange: RETRY_EXCHANGE,
            retry_queue: RETRY_QUEUE,
            dead_letter_queue: DEAD_LETTER_QUEUE,
            retry_delay: RETRY_DELAY,
            prefetch: 1,
        }
    }
}

impl EventTopology {
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Routing key used on the retry exchange.
    pub fn retry_routing_key(&self) -> &'static str {
        self.queue
    }

    pub fn definitions(&self) -> EventDefinitions {
        EventDefinitions {
            main_exchange: ExchangeDefinition::new(self.exchange).topic().durable(),
            retry_exchange: ExchangeDefinition::new(self.retry_exchange).direct().durable(),
            retry_queue: QueueDefinition::new(self.retry_queue)
                .durable()
                .ttl(self.retry_delay)
                .dead_letter_to("", self.queue),
            retry_binding: QueueBinding::new(self.retry_queue)
                .exchange(self.retry_exchange)
                .routing_key(self.retry_routing_key()),
            dead_letter_queue: QueueDefinition::new(self.dead_letter_queue).durable(),
            main_queue: QueueDefinition::new(self.queue).durable(),
            main_binding: QueueBinding::new(self.queue)
                .exchange(self.exchange)
                .routing_key(self.binding_key),
        }
    }

    /// Registers the declarations on `topology` in installation order.
    pub fn register<'tp, T>(&self, defs: &'tp EventDefinitions, topology: T) -> T
    where
        T: Topology<'tp>,
    {
        topology
            .exchange(&defs.main_exchange)
            .exchange(&defs.retry_exchange)
            .queue(&defs.retry_queue)
            .queue_binding(&defs.retry_binding)
            .queue(&defs.dead_letter_queue)
            .queue(&defs.main_queue)
            .queue_binding(&defs.main_binding)
            .qos(self.prefetch)
    }

    /// Declares the whole inbound topology on `channel`.
    pub async fn setup(&self, channel: Arc<Channel>) -> Result<(), AmqpError> {
        let defs = self.definitions();
        self.register(&defs, AmqpTopology::new(channel))
            .install()
            .await?;

        debug!(queue = self.queue, "topology ready");
        Ok(())
    }
}

/// Declares the outbound exchange used by the publisher.
pub async fn setup_outbound(channel: Arc<Channel>, exchange: &str) -> Result<(), AmqpError> {
    let def = ExchangeDefinition::new(exchange).topic().durable();
    AmqpTopology::new(channel).exchange(&def).install().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeKind;

    #[derive(Default)]
    struct RecordingTopology {
        steps: Vec<String>,
    }

    #[async_trait]
    impl<'tp> Topology<'tp> for RecordingTopology {
        fn exchange(mut self, def: &'tp ExchangeDefinition<'tp>) -> Self {
            self.steps.push(format!("exchange:{}:{:?}:{}", def.name, def.kind, def.durable));
            self
        }

        fn queue(mut self, def: &'tp QueueDefinition) -> Self {
            self.steps.push(format!("queue:{}:{}", def.name, def.durable));
            self
        }

        fn queue_binding(mut self, binding: &'tp QueueBinding<'tp>) -> Self {
            self.steps.push(format!(
                "bind:{}<-{}:{}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            ));
            self
        }

        fn qos(mut self, prefetch: u16) -> Self {
            self.steps.push(format!("qos:{}", prefetch));
            self
        }

        async fn install(&self) -> Result<(), AmqpError> {
            Ok(())
        }
    }

    #[test]
    fn declarations_follow_installation_order() {
        let topology = EventTopology::default();
        let defs = topology.definitions();
        let recorded = topology.register(&defs, RecordingTopology::default());

        assert_eq!(
            recorded.steps,
            vec![
                "exchange:auth_events:Topic:true",
                "exchange:company_service.retry:Direct:true",
                "queue:company_service_queue.retry:true",
                "bind:company_service_queue.retry<-company_service.retry:company_service_queue",
                "queue:company_service_queue.dlq:true",
                "queue:company_service_queue:true",
                "bind:company_service_queue<-auth_events:user.*",
                "qos:1",
            ]
        );
    }

    #[test]
    fn retry_queue_expires_into_main_queue() {
        let topology = EventTopology::default().with_retry_delay(Duration::from_millis(250));
        let defs = topology.definitions();

        assert_eq!(defs.retry_queue.ttl, Some(250));
        assert_eq!(defs.retry_queue.dead_letter_exchange.as_deref(), Some(""));
        assert_eq!(
            defs.retry_queue.dead_letter_routing_key.as_deref(),
            Some(MAIN_QUEUE)
        );
        assert_eq!(defs.main_queue.dead_letter_exchange, None);
        assert_eq!(defs.main_exchange.kind, ExchangeKind::Topic);
        assert_eq!(defs.retry_exchange.kind, ExchangeKind::Direct);
    }

    #[test]
    fn definitions_are_stable_across_reconnects() {
        let topology = EventTopology::default();
        let first = topology.definitions();
        let second = topology.definitions();

        assert_eq!(first.retry_queue, second.retry_queue);
        assert_eq!(first.main_queue, second.main_queue);
        assert_eq!(first.main_binding, second.main_binding);
    }

    #[test]
    fn topic_binding_matching() {
        assert!(binding_matches("user.*", "user.created"));
        assert!(binding_matches("user.*", "user.email_verified"));
        assert!(!binding_matches("user.*", "auth.user.created"));
        assert!(!binding_matches("user.*", "user.created.v2"));
        assert!(binding_matches("auth.user.*", "auth.user.created"));
        assert!(binding_matches("user.#", "user"));
        assert!(binding_matches("#.created", "auth.user.created"));
        assert!(!binding_matches("user.created", "user.deleted"));
    }

    #[test]
    fn io_failures_are_not_conflicts() {
        let err = lapin::Error::ChannelsLimitReached;
        assert_eq!(
            classify(&err, "company_service_queue", AmqpError::DeclareQueueError),
            AmqpError::DeclareQueueError("company_service_queue".to_owned())
        );
    }
}
