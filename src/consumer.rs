// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! The per-message half of the consumer engine: decode the payload, run the
//! registered handler, and translate the outcome into an acknowledgement.
//!
//! A handler verdict of `Ok(true)` acks the message. `Ok(false)` or a
//! handler error nacks it under the engine's [`RetryPolicy`], leaving
//! redelivery to broker policy. A payload that does not decode as JSON is
//! nacked immediately and without requeue: redelivering it could never
//! succeed.

use crate::{config::RetryPolicy, errors::AmqpError, handler::MessageHandler, sink::ErrorSink};
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
};
use serde_json::Value;
use tracing::{debug, error};

/// What to do with a delivery after the handler (or decoder) ruled on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Ack,
    Nack { requeue: bool },
}

/// Decodes a delivery payload as JSON.
pub(crate) fn decode_payload(data: &[u8]) -> Result<Value, AmqpError> {
    serde_json::from_slice(data).map_err(|_| AmqpError::ParsePayloadError)
}

/// Maps a handler outcome to an acknowledgement decision.
pub(crate) fn disposition(verdict: Result<bool, ()>, policy: &RetryPolicy) -> Disposition {
    match verdict {
        Ok(true) => Disposition::Ack,
        _ => Disposition::Nack {
            requeue: policy.requeue,
        },
    }
}

/// Processes one delivery end to end.
///
/// Handler faults never propagate: they are logged, captured, and turned
/// into a nack. Only acknowledgement transport failures are returned, so
/// the subscription loop can log them.
pub(crate) async fn process_delivery(
    delivery: &Delivery,
    handler: &dyn MessageHandler,
    sink: &dyn ErrorSink,
    policy: &RetryPolicy,
) -> Result<(), AmqpError> {
    debug!(
        exchange = delivery.exchange.as_str(),
        routing_key = delivery.routing_key.as_str(),
        "received message"
    );

    let message = match decode_payload(&delivery.data) {
        Ok(message) => message,
        Err(err) => {
            error!("removing message from queue - reason: payload is not valid json");
            sink.capture(&err, None);
            return finish(delivery, Disposition::Nack { requeue: false }).await;
        }
    };

    let verdict = match handler.handle(message).await {
        Ok(ack) => Ok(ack),
        Err(err) => {
            error!(error = err.to_string(), "message handler failed");
            sink.capture(&AmqpError::ConsumerError(err.to_string()), None);
            Err(())
        }
    };

    let outcome = disposition(verdict, policy);

    if matches!(outcome, Disposition::Nack { .. }) && !policy.nack_delay.is_zero() {
        tokio::time::sleep(policy.nack_delay).await;
    }

    finish(delivery, outcome).await
}

async fn finish(delivery: &Delivery, disposition: Disposition) -> Result<(), AmqpError> {
    match disposition {
        Disposition::Ack => delivery
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to ack message");
                AmqpError::AckMessageError
            }),
        Disposition::Nack { requeue } => delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to nack message");
                AmqpError::NackMessageError
            }),
    }
}
