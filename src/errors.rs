// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Reliability Engine
//!
//! This module provides the error taxonomy for all broker operations.
//! The `AmqpError` enum represents every failure scenario that can occur
//! during connection, channel, topology declaration, publishing, and
//! consumer handling.
//!
//! Transient transport failures are retried internally and never surface
//! through the public contract; these variants exist for the internal
//! `Result` plumbing, for logging, and for the error-reporting sink.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// This enum covers connection issues, channel creation, exchange and queue
/// declarations, message publishing, and consumer-related errors. Each
/// variant provides specific context about what operation failed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindingError(String, String),

    /// Error configuring the prefetch/fair-dispatch limit
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error subscribing a consumer to a queue
    #[error("failure to subscribe consumer on queue `{0}`")]
    SubscribeError(String),

    /// Error publishing a message, including a broker nack
    #[error("failure to publish")]
    PublishingError,

    /// Error parsing or serializing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error raised by a consumer handler or the consumption plumbing
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error reported by the outbox store
    #[error("outbox store failure `{0}`")]
    OutboxError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_error_names_both_sides() {
        let err = AmqpError::BindingError("job_queue".to_owned(), "video_job".to_owned());
        assert_eq!(
            err.to_string(),
            "failure to bind queue `job_queue` to exchange `video_job`"
        );
    }

    #[test]
    fn errors_are_comparable() {
        assert_eq!(AmqpError::ConnectionError, AmqpError::ConnectionError);
        assert_ne!(
            AmqpError::DeclareQueueError("a".to_owned()),
            AmqpError::DeclareQueueError("b".to_owned())
        );
    }
}
