// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Event Integration Layer
//!
//! Two taxonomies live here. `AmqpError` covers everything that can go wrong
//! while talking to the broker (connection, channel, topology, publishing,
//! acknowledging). `HandlerError` covers everything that can go wrong while
//! turning one delivered message into a business action; every `HandlerError`
//! is routed through the retry/dead-letter path by the consumer.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// No open channel is available for the requested operation
    #[error("channel not ready")]
    NotConnected,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// The broker already holds an entity with the same name but different
    /// parameters. This is a deployment mismatch and is never retried.
    #[error("conflicting topology declaration for `{0}`")]
    TopologyConflict(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error publishing a message to the retry exchange
    #[error("failure to publish to retry")]
    PublishingToRetryError,

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq")]
    PublishingToDQLError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error")]
    ConsumerDeclarationError,
}

impl AmqpError {
    /// Whether the error must stop the Reconnection Supervisor.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AmqpError::TopologyConflict(_))
    }
}

/// Errors raised while processing a single inbound message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The body is not a valid event envelope
    #[error("failure to decode envelope: {0}")]
    Decode(String),

    /// The envelope payload lacks a field the handler needs
    #[error("missing field `{0}` in event data")]
    MissingField(&'static str),

    /// The business collaborator rejected the event
    #[error("service failure: {0}")]
    Service(String),
}

impl From<ServiceError> for HandlerError {
    fn from(err: ServiceError) -> HandlerError {
        HandlerError::Service(err.0)
    }
}

/// Failure reported by a business collaborator invoked from a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ServiceError(pub String);
