// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # The Messaging Service Contract
//!
//! The public interface every engine variant implements, and the factory
//! that selects a variant from configuration at startup. Downstream
//! services depend only on this trait; which engine sits behind it is a
//! deployment decision.

use crate::{
    config::{AmqpConfig, EngineKind, EngineOptions},
    declarative::DeclarativeEngine,
    engine::AmqpEngine,
    exchange::ExchangeKind,
    handler::MessageHandler,
    outbox::Outbox,
    sink::ErrorSink,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Reliable publish/consume over a RabbitMQ broker.
///
/// All methods are safe to call concurrently. Registration methods are
/// idempotent, and none of them surface broker failures to the caller:
/// transient errors are retried internally, declaration errors are logged
/// and reported to the error sink.
#[async_trait]
pub trait MessagingService: Send + Sync {
    /// Registers an exchange for publishing and declares it on the broker
    /// (durable, non-auto-delete, non-internal). Idempotent; this is also
    /// what the reconnect replay re-runs.
    async fn init_publisher(&self, exchange_name: &str, exchange_kind: ExchangeKind);

    /// Registers a queue bound to an exchange and declares both on the
    /// broker (durable, non-exclusive, non-auto-delete), applying the
    /// prefetch/fair-dispatch limit. Idempotent.
    async fn init_consumer(
        &self,
        exchange_name: &str,
        exchange_kind: ExchangeKind,
        queue_name: &str,
        binding_key: &str,
        prefetch: u16,
    );

    /// Publishes a JSON message to a registered exchange.
    ///
    /// Returns `true` when the message was durably accepted by the engine:
    /// either confirmed by the broker, or saved for a later resend. Callers
    /// cannot distinguish the two.
    async fn publish(&self, exchange_name: &str, routing_key: &str, message: Value) -> bool;

    /// Subscribes a handler to a registered queue and returns the
    /// broker-assigned consumer tag, or `None` when the subscription could
    /// not be established. The subscription survives broker outages: the
    /// reconnect cycle re-subscribes it without caller involvement.
    async fn consume(&self, queue_name: &str, handler: Arc<dyn MessageHandler>) -> Option<String>;

    /// Coordinated shutdown: cancels background timers and gracefully
    /// closes all broker connections.
    async fn stop(&self);
}

/// Builds the engine variant selected by the options.
///
/// The declarative variant has no outbox fallback, so the store is only
/// handed to the imperative engine.
pub fn new_messaging_service(
    config: AmqpConfig,
    options: EngineOptions,
    outbox: Arc<dyn Outbox>,
    sink: Arc<dyn ErrorSink>,
) -> Arc<dyn MessagingService> {
    match options.engine {
        EngineKind::Imperative => Arc::new(AmqpEngine::new(config, options, outbox, sink)),
        EngineKind::Declarative => Arc::new(DeclarativeEngine::new(config, options, sink)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{outbox::InMemoryOutbox, sink::LogSink};

    #[tokio::test]
    async fn factory_builds_the_configured_variant() {
        for kind in [EngineKind::Imperative, EngineKind::Declarative] {
            let service = new_messaging_service(
                AmqpConfig::default(),
                EngineOptions {
                    engine: kind,
                    ..EngineOptions::default()
                },
                Arc::new(InMemoryOutbox::new()),
                Arc::new(LogSink),
            );

            // both variants must be usable through the contract without a
            // broker in reach
            assert!(
                service
                    .publish("video_job", "created", serde_json::json!({}))
                    .await
            );
            service.stop().await;
        }
    }
}
