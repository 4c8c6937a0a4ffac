// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Subscriber
//!
//! Lifecycle of the inbound side:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> TopologyReady -> Consuming
//!       ^                                                        |
//!       +---- Reconnecting <---- Disconnected <---- broker error -+
//! close() from anywhere -> Closed (terminal)
//! ```
//!
//! The background task spawned by `start` owns the consume loop and is the
//! only place that decides when to reconnect. Deliveries are processed one at
//! a time; with a prefetch of 1 the broker never hands out a second message
//! before the first is settled.

use crate::{
    channel::{AmqpConnection, ConnectionState},
    configs::{ReconnectPolicy, RetryPolicy},
    consumer::{consume, AmqpDeliverySink, InboundMessage},
    dispatcher::Dispatcher,
    errors::AmqpError,
    reconnect::ReconnectSupervisor,
    topology::EventTopology,
};
use futures_util::StreamExt;
use lapin::{options::BasicConsumeOptions, types::FieldTable, Channel, Consumer};
use opentelemetry::global;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Why a consuming session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Lost,
}

struct Session {
    channel: Arc<Channel>,
    consumer: Consumer,
}

struct SubscriberInner {
    url: Option<String>,
    connection: Arc<AmqpConnection>,
    topology: EventTopology,
    dispatcher: Dispatcher,
    retry: RetryPolicy,
    reconnect: ReconnectPolicy,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
}

pub struct EventSubscriber {
    inner: Arc<SubscriberInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventSubscriber {
    /// Creates a subscriber. With `url == None` the subscriber is disabled:
    /// `start` only logs a warning.
    pub fn new(
        url: Option<String>,
        connection: Arc<AmqpConnection>,
        dispatcher: Dispatcher,
    ) -> EventSubscriber {
        let (shutdown, _) = watch::channel(false);
        let topology = EventTopology::default();
        dispatcher.unreachable(topology.binding_key);

        EventSubscriber {
            inner: Arc::new(SubscriberInner {
                url,
                connection,
                topology,
                dispatcher,
                retry: RetryPolicy::default(),
                reconnect: ReconnectPolicy::default(),
                started: AtomicBool::new(false),
                shutdown,
            }),
            task: Mutex::new(None),
        }
    }

    /// Overrides the retry policy; the retry queue TTL follows its delay.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.retry = retry;
            inner.topology = inner.topology.clone().with_retry_delay(retry.delay);
        }
        self
    }

    pub fn with_reconnect_policy(mut self, reconnect: ReconnectPolicy) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.reconnect = reconnect;
        }
        self
    }

    /// Connects, declares the topology and starts consuming in the
    /// background. Idempotent.
    ///
    /// Transient failures are handed to the Reconnection Supervisor and
    /// `Ok(())` is returned. Only a topology conflict on the first attempt
    /// is returned as an error.
    pub async fn start(&self) -> Result<(), AmqpError> {
        let Some(url) = self.inner.url.clone() else {
            warn!("rabbitmq url not configured, event subscriber disabled");
            return Ok(());
        };

        if *self.inner.shutdown.borrow() {
            debug!("event subscriber closed, ignoring start");
            return Ok(());
        }

        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("event subscriber already started");
            return Ok(());
        }

        let mut shutdown = self.inner.shutdown.subscribe();
        let attempt = tokio::select! {
            result = self.inner.open_session(&url) => result,
            _ = closed(&mut shutdown) => {
                debug!("event subscriber closed while starting");
                return Ok(());
            }
        };

        let mut supervisor = ReconnectSupervisor::new(self.inner.reconnect);
        let session = match attempt {
            Ok(session) => {
                supervisor.reset();
                info!("event subscriber started successfully");
                Some(session)
            }
            Err(err) if err.is_fatal() => {
                error!(error = err.to_string(), "topology conflict, event subscriber not started");
                return Err(err);
            }
            Err(err) => {
                error!(error = err.to_string(), "failed to start event subscriber");
                None
            }
        };

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run(url, supervisor, session).await });

        match self.task.lock() {
            Ok(mut task) => *task = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }

        Ok(())
    }

    /// Readiness probe: true only while consuming.
    pub fn is_ready(&self) -> bool {
        self.inner.connection.state() == ConnectionState::Consuming
            && self.inner.connection.is_ready()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Graceful shutdown: lets the in-flight message finish, stops
    /// consuming, then closes channel and connection. A pending connect or
    /// reconnect attempt is abandoned. Idempotent.
    pub async fn close(&self) {
        self.inner.shutdown.send_replace(true);

        let handle = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = err.to_string(), "event subscriber task failed");
            }
        }

        self.inner.connection.close().await;
        info!("event subscriber closed");
    }
}

impl SubscriberInner {
    /// connect -> setup topology -> begin consuming
    async fn open_session(&self, url: &str) -> Result<Session, AmqpError> {
        let channel = self.connection.connect(url).await?;

        if let Err(err) = self.topology.setup(channel.clone()).await {
            self.abandon().await;
            return Err(err);
        }
        self.connection.set_state(ConnectionState::TopologyReady);

        let consumer = match channel
            .basic_consume(
                self.topology.queue,
                &format!("{}-{}", self.connection.name(), Uuid::new_v4()),
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                self.abandon().await;
                return Err(AmqpError::ConsumerDeclarationError);
            }
        };

        self.connection.set_state(ConnectionState::Consuming);
        info!(queue = self.topology.queue, "started consuming messages from queue");

        Ok(Session { channel, consumer })
    }

    async fn abandon(&self) {
        self.connection.release().await;
        self.connection.set_state(ConnectionState::Disconnected);
    }

    async fn run(
        self: Arc<Self>,
        url: String,
        mut supervisor: ReconnectSupervisor,
        mut session: Option<Session>,
    ) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if let Some(current) = session.take() {
                if self.consume_until_lost(current, &mut shutdown).await == SessionEnd::Shutdown {
                    break;
                }
                warn!("rabbitmq connection lost");
                self.abandon().await;
            }

            if *shutdown.borrow() {
                break;
            }

            let Some(delay) = supervisor.next_delay() else {
                self.connection.set_state(ConnectionState::Disconnected);
                break;
            };
            self.connection.set_state(ConnectionState::Reconnecting);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = closed(&mut shutdown) => break,
            }

            info!(attempt = supervisor.attempts(), "attempting to reconnect to rabbitmq...");
            // a handshake the broker never completes must not outlive close()
            let attempt = tokio::select! {
                result = self.open_session(&url) => result,
                _ = closed(&mut shutdown) => break,
            };

            match attempt {
                Ok(next) => {
                    supervisor.reset();
                    info!("event subscriber started successfully");
                    session = Some(next);
                }
                Err(err) if err.is_fatal() => {
                    error!(error = err.to_string(), "topology conflict, giving up reconnection");
                    break;
                }
                Err(err) => {
                    error!(error = err.to_string(), "failed to start event subscriber");
                }
            }
        }

        debug!("event subscriber loop stopped");
    }

    async fn consume_until_lost(
        &self,
        session: Session,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let Session {
            channel,
            mut consumer,
        } = session;
        let mut state = self.connection.subscribe();
        let tracer = global::tracer("amqp consumer");

        loop {
            let next = tokio::select! {
                biased;
                _ = closed(shutdown) => return SessionEnd::Shutdown,
                _ = lost(&mut state) => return SessionEnd::Lost,
                next = consumer.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    error!(error = err.to_string(), "errors consume msg");
                    return SessionEnd::Lost;
                }
                None => {
                    warn!("consumer stream ended");
                    return SessionEnd::Lost;
                }
            };

            let sink = AmqpDeliverySink::new(&channel, &delivery, &self.topology);
            if let Err(err) = consume(
                &tracer,
                InboundMessage::from_delivery(&delivery),
                &self.dispatcher,
                &self.retry,
                &sink,
            )
            .await
            {
                error!(error = err.to_string(), "error consume msg, dropping channel");
                return SessionEnd::Lost;
            }
        }
    }
}

/// Resolves once shutdown has been requested.
async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

/// Resolves once the connection no longer has a usable channel.
async fn lost(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state.wait_for(|s| !s.has_channel()).await;
}
