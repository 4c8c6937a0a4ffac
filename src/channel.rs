// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module owns the connection/channel pair used by one direction of
//! traffic (publishing or consuming). The pair is replaced wholesale on every
//! reconnect, so callers holding an `Arc<Channel>` never see a half-valid one.
//!
//! Asynchronous connection errors reported by the broker client are turned
//! into `ConnectionState` transitions published on a `watch` channel; the
//! subscriber's supervisor is the only component that reacts to them.

use crate::errors::AmqpError;
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// AMQP reply code used for deliberate closes
const REPLY_SUCCESS: u16 = 200;

/// Lifecycle of one broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    TopologyReady,
    Consuming,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    /// Whether a usable channel is expected in this state.
    pub fn has_channel(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::TopologyReady | ConnectionState::Consuming
        )
    }
}

struct AmqpLink {
    connection: Arc<Connection>,
    channel: Arc<Channel>,
}

/// Broker Connection Manager.
///
/// One instance per direction. It is cheap to share behind an `Arc` and all
/// methods take `&self`.
pub struct AmqpConnection {
    name: String,
    state: Arc<watch::Sender<ConnectionState>>,
    generation: Arc<AtomicU64>,
    link: Mutex<Option<AmqpLink>>,
}

impl AmqpConnection {
    /// Creates a disconnected manager. `name` is reported to the broker as
    /// the connection name.
    pub fn new(name: &str) -> AmqpConnection {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        AmqpConnection {
            name: name.to_owned(),
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
            link: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opens a new connection and channel, replacing any previous pair.
    ///
    /// Failures are not retried here. Whatever was opened before the failure
    /// is released before returning.
    pub async fn connect(&self, url: &str) -> Result<Arc<Channel>, AmqpError> {
        if self.state() == ConnectionState::Closed {
            debug!(name = %self.name, "connect requested on a closed connection");
            return Err(AmqpError::ConnectionError);
        }

        self.set_state(ConnectionState::Connecting);
        self.release().await;

        debug!(name = %self.name, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.name.clone()));

        let conn = match Connection::connect(url, options).await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), name = %self.name, "failure to connect");
                self.set_state(ConnectionState::Disconnected);
                return Err(AmqpError::ConnectionError);
            }
        };
        debug!(name = %self.name, "amqp connected");

        debug!(name = %self.name, "creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => Arc::new(c),
            Err(err) => {
                error!(error = err.to_string(), name = %self.name, "error to create the channel");
                if let Err(err) = conn.close(REPLY_SUCCESS, "channel creation failed").await {
                    debug!(error = err.to_string(), "failure to close half-open connection");
                }
                self.set_state(ConnectionState::Disconnected);
                return Err(AmqpError::ChannelError);
            }
        };
        debug!(name = %self.name, "channel created");

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.watch_errors(&conn, generation);

        let connection = Arc::new(conn);
        let stale = self.swap_link(Some(AmqpLink {
            connection: connection.clone(),
            channel: channel.clone(),
        }));
        if let Some(stale) = stale {
            Self::close_link(&self.name, stale).await;
        }

        let connected = self.state.send_if_modified(|s| {
            if *s == ConnectionState::Connecting {
                *s = ConnectionState::Connected;
                true
            } else {
                false
            }
        });

        if !connected {
            // close() or a broker error won the race while we were connecting
            warn!(name = %self.name, "connection superseded while connecting");
            self.release().await;
            return Err(AmqpError::ConnectionError);
        }

        info!(name = %self.name, "connected to rabbitmq");
        Ok(channel)
    }

    /// Returns the current channel when the connection is usable.
    pub fn channel(&self) -> Option<Arc<Channel>> {
        if !self.state().has_channel() {
            return None;
        }

        let guard = self.link.lock().ok()?;
        let channel = guard
            .as_ref()
            .filter(|link| link.channel.status().connected())
            .map(|link| link.channel.clone());
        channel
    }

    /// Readiness flag: a connected channel is available.
    pub fn is_ready(&self) -> bool {
        self.channel().is_some()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Moves to `next` unless the connection was deliberately closed.
    pub(crate) fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Closed || *s == next {
                false
            } else {
                debug!(name = %self.name, from = ?*s, to = ?next, "connection state");
                *s = next;
                true
            }
        });
    }

    /// Drops the current pair without entering the terminal state.
    pub(crate) async fn release(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(link) = self.swap_link(None) {
            Self::close_link(&self.name, link).await;
        }
    }

    /// Deliberate shutdown. Idempotent; no reconnection follows.
    pub async fn close(&self) {
        let already_closed = self.state.send_replace(ConnectionState::Closed) == ConnectionState::Closed;
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(link) = self.swap_link(None) {
            Self::close_link(&self.name, link).await;
        }

        if !already_closed {
            info!(name = %self.name, "rabbitmq connection closed");
        }
    }

    fn swap_link(&self, next: Option<AmqpLink>) -> Option<AmqpLink> {
        match self.link.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, next),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), next),
        }
    }

    fn watch_errors(&self, conn: &Connection, generation: u64) {
        let state = self.state.clone();
        let current = self.generation.clone();
        let name = self.name.clone();

        conn.on_error(move |err| {
            if current.load(Ordering::SeqCst) != generation {
                return;
            }

            error!(error = err.to_string(), name = %name, "rabbitmq connection error");
            state.send_if_modified(|s| match *s {
                ConnectionState::Closed | ConnectionState::Disconnected => false,
                _ => {
                    *s = ConnectionState::Disconnected;
                    true
                }
            });
        });
    }

    async fn close_link(name: &str, link: AmqpLink) {
        if link.channel.status().connected() {
            if let Err(err) = link.channel.close(REPLY_SUCCESS, "closing").await {
                debug!(error = err.to_string(), name = %name, "failure to close channel");
            }
        }

        if link.connection.status().connected() {
            if let Err(err) = link.connection.close(REPLY_SUCCESS, "closing").await {
                debug!(error = err.to_string(), name = %name, "failure to close connection");
            }
        }
    }
}

/// The two broker connections of the service, constructed once at startup.
pub struct BrokerConnections {
    pub publisher: Arc<AmqpConnection>,
    pub subscriber: Arc<AmqpConnection>,
}

impl BrokerConnections {
    pub fn new(app_name: &str) -> BrokerConnections {
        BrokerConnections {
            publisher: Arc::new(AmqpConnection::new(&format!("{}-publisher", app_name))),
            subscriber: Arc::new(AmqpConnection::new(&format!("{}-subscriber", app_name))),
        }
    }
}
