// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Processing of a single delivery: decode the envelope, dispatch it by event
//! type, then settle the delivery. The original delivery is always
//! acknowledged once the outcome has been recorded elsewhere:
//!
//! - handler success or unknown event type: ack
//! - failure with `retry_count < max_retries`: republish to the retry exchange
//!   with the count incremented, then ack. The retry queue TTL brings it back
//!   to the main queue.
//! - failure with `retry_count >= max_retries`: publish to the dead-letter
//!   queue stamped with the failure reason and time, then ack.
//!
//! A malformed body counts as a handler failure. When the republish itself
//! fails the delivery is left unacknowledged and the error is returned so the
//! subscriber can drop the channel; the broker then redelivers it.

use crate::{
    configs::RetryPolicy,
    dispatcher::Dispatcher,
    envelope::{EventEnvelope, RetryMetadata},
    errors::{AmqpError, HandlerError},
    otel,
    topology::EventTopology,
};
use async_trait::async_trait;
use chrono::Utc;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicPublishOptions},
    types::FieldTable,
    Channel,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::borrow::Cow;
use tracing::{debug, error, warn};

/// AMQP delivery mode for messages that must survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// What happens to a delivery once it has been processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Retry(RetryMetadata),
    DeadLetter(RetryMetadata),
}

/// Retry/dead-letter escalation policy.
pub fn disposition(
    outcome: &Result<(), HandlerError>,
    retry: &RetryMetadata,
    policy: &RetryPolicy,
) -> Disposition {
    match outcome {
        Ok(()) => Disposition::Ack,
        Err(_) if retry.retry_count < policy.max_retries => Disposition::Retry(retry.next_attempt()),
        Err(err) => Disposition::DeadLetter(retry.exhausted(&err.to_string(), Utc::now())),
    }
}

/// Broker-side operations needed to settle one delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Acknowledges the original delivery.
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Republishes the original body to the retry exchange with `headers`.
    async fn retry(&self, headers: FieldTable) -> Result<(), AmqpError>;

    /// Publishes the original body to the dead-letter queue with `headers`.
    async fn dead_letter(&self, headers: FieldTable) -> Result<(), AmqpError>;
}

/// A delivery as seen by the processing logic.
#[derive(Debug, Clone, Copy)]
pub struct InboundMessage<'m> {
    pub body: &'m [u8],
    pub headers: Option<&'m FieldTable>,
}

impl<'m> InboundMessage<'m> {
    pub fn from_delivery(delivery: &'m Delivery) -> InboundMessage<'m> {
        InboundMessage {
            body: &delivery.data,
            headers: delivery.properties.headers().as_ref(),
        }
    }
}

/// Processes one message and settles it through `sink`.
pub async fn consume(
    tracer: &BoxedTracer,
    msg: InboundMessage<'_>,
    dispatcher: &Dispatcher,
    policy: &RetryPolicy,
    sink: &dyn MessageSink,
) -> Result<Disposition, AmqpError> {
    let retry = RetryMetadata::from_headers(msg.headers);
    let decoded = EventEnvelope::decode(msg.body);

    let span_name = match &decoded {
        Ok(envelope) => envelope.event_type.clone(),
        Err(_) => "undecodable".to_owned(),
    };
    let (ctx, mut span) = otel::new_span(msg.headers, tracer, &span_name);

    let outcome = match &decoded {
        Ok(envelope) => {
            debug!(
                event_type = envelope.event_type,
                timestamp = envelope.timestamp,
                retry_count = retry.retry_count,
                "received event"
            );

            let Some(handler) = dispatcher.handler(&envelope.event_type) else {
                debug!(
                    event_type = envelope.event_type,
                    "removing message from queue - reason: unhandled event type"
                );
                settle(sink.ack().await, &mut span)?;
                span.set_status(Status::Ok);
                return Ok(Disposition::Ack);
            };

            handler.exec(&ctx, envelope).await
        }
        Err(err) => Err(err.clone()),
    };

    if let Err(err) = &outcome {
        error!(error = err.to_string(), event_type = span_name, "failure to process message");
        span.record_error(err);
    }

    let disposition = disposition(&outcome, &retry, policy);

    match &disposition {
        Disposition::Ack => {
            debug!("message successfully processed");
            settle(sink.ack().await, &mut span)?;
            span.set_status(Status::Ok);
        }
        Disposition::Retry(next) => {
            warn!(
                retry_count = next.retry_count,
                max_retries = policy.max_retries,
                "error whiling handling msg, sending to retry"
            );
            settle(sink.retry(next.apply(msg.headers)).await, &mut span)?;
            settle(sink.ack().await, &mut span)?;
            span.set_status(Status::Error {
                description: Cow::from("msg was sent to retry"),
            });
        }
        Disposition::DeadLetter(exhausted) => {
            error!(
                retry_count = exhausted.retry_count,
                reason = exhausted.failed_reason.as_deref().unwrap_or_default(),
                "too many attempts, sending to dlq"
            );
            settle(sink.dead_letter(exhausted.apply(msg.headers)).await, &mut span)?;
            settle(sink.ack().await, &mut span)?;
            span.set_status(Status::Error {
                description: Cow::from("msg was sent to dlq"),
            });
        }
    }

    Ok(disposition)
}

fn settle<S: Span>(result: Result<(), AmqpError>, span: &mut S) -> Result<(), AmqpError> {
    if let Err(err) = &result {
        error!(error = err.to_string(), "failure to settle message");
        span.record_error(err);
        span.set_status(Status::Error {
            description: Cow::from(err.to_string()),
        });
    }
    result
}

/// `MessageSink` over a live delivery and the channel it arrived on.
pub(crate) struct AmqpDeliverySink<'d> {
    channel: &'d Channel,
    delivery: &'d Delivery,
    topology: &'d EventTopology,
}

impl<'d> AmqpDeliverySink<'d> {
    pub(crate) fn new(
        channel: &'d Channel,
        delivery: &'d Delivery,
        topology: &'d EventTopology,
    ) -> AmqpDeliverySink<'d> {
        AmqpDeliverySink {
            channel,
            delivery,
            topology,
        }
    }

    async fn republish(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: FieldTable,
    ) -> Result<(), lapin::Error> {
        let properties = self
            .delivery
            .properties
            .clone()
            .with_headers(headers)
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE);

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &self.delivery.data,
                properties,
            )
            .await?;

        Ok(())
    }
}

#[async_trait]
impl MessageSink for AmqpDeliverySink<'_> {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.delivery
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn retry(&self, headers: FieldTable) -> Result<(), AmqpError> {
        self.republish(
            self.topology.retry_exchange,
            self.topology.retry_routing_key(),
            headers,
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error whiling sending to retry");
            AmqpError::PublishingToRetryError
        })
    }

    async fn dead_letter(&self, headers: FieldTable) -> Result<(), AmqpError> {
        self.republish("", self.topology.dead_letter_queue, headers)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling sending to dlq");
                AmqpError::PublishingToDQLError
            })
    }
}
