// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publishing
//!
//! Publishes JSON messages over a confirm channel and waits for the broker
//! confirmation. A nack counts as a failure: callers treat any error from
//! here as "not delivered" and fall back to the outbox.

use crate::errors::AmqpError;
use lapin::{
    options::BasicPublishOptions, publisher_confirm::Confirmation, types::ShortString,
    BasicProperties, Channel,
};
use serde_json::Value;
use tracing::{error, warn};
use uuid::Uuid;

/// Content type stamped on every published message
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Publishes a message and awaits its delivery confirmation.
///
/// The payload is JSON-encoded, tagged with the JSON content type and a
/// fresh message id. Returns an error on serialization failure, transport
/// failure, or a broker nack.
pub(crate) async fn publish_with_confirm(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    message: &Value,
) -> Result<(), AmqpError> {
    let payload = serde_json::to_vec(message).map_err(|err| {
        error!(error = err.to_string(), "error to serialize the message");
        AmqpError::ParsePayloadError
    })?;

    let confirm = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions {
                immediate: false,
                mandatory: false,
            },
            &payload,
            BasicProperties::default()
                .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
                .with_message_id(ShortString::from(Uuid::new_v4().to_string())),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error publishing message");
            AmqpError::PublishingError
        })?
        .await
        .map_err(|err| {
            error!(
                error = err.to_string(),
                "error awaiting publisher confirmation"
            );
            AmqpError::PublishingError
        })?;

    match confirm {
        Confirmation::Nack(_) => {
            warn!(exchange, routing_key, "message nacked by the broker");
            Err(AmqpError::PublishingError)
        }
        _ => Ok(()),
    }
}
