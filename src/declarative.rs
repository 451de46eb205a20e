// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Declarative-Topology Engine Variant
//!
//! [`DeclarativeEngine`] implements the same
//! [`MessagingService`](crate::service::MessagingService) contract as the
//! imperative engine, but with an inverted topology model: the `init_*`
//! calls only accumulate a broker definition (exchanges, queues, bindings,
//! and named publications/subscriptions), and the whole definition is
//! asserted against the broker at once when the connection is first needed.
//!
//! Publishing addresses a named publication derived from the exchange and
//! routing key rather than a per-exchange channel, and rejected deliveries
//! are nacked under the configured [`RetryPolicy`](crate::config::RetryPolicy)
//! (deferred nack) instead of immediately. Publishing to a publication that was never declared is
//! logged and reported, and the call still reports acceptance.
//!
//! This variant keeps a single broker connection for both roles and does
//! not run an outbox or a reconnection coordinator; it targets deployments
//! where the broker connection is expected to be stable and topology is
//! centrally defined.

use crate::{
    channel,
    config::{AmqpConfig, EngineOptions},
    consumer,
    errors::AmqpError,
    exchange::ExchangeKind,
    handler::MessageHandler,
    service::MessagingService,
    sink::ErrorSink,
    topology,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::BasicConsumeOptions, protocol::constants::REPLY_SUCCESS, types::FieldTable, Channel,
    Connection,
};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

/// Builds the publication name a publish call addresses.
///
/// A routing key scopes the publication; without one the publication is
/// named after the exchange alone.
fn publication_name(exchange: &str, routing_key: &str) -> String {
    if routing_key.is_empty() {
        exchange.to_owned()
    } else {
        format!("{exchange}_{routing_key}")
    }
}

#[derive(Clone)]
struct QueueSpec {
    exchange: String,
    binding_key: String,
}

#[derive(Clone)]
struct Publication {
    exchange: String,
    routing_key: String,
}

#[derive(Clone)]
struct Subscription {
    prefetch: u16,
}

/// The accumulated broker definition, installed on first use.
#[derive(Default)]
struct BrokerDefinition {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueSpec>,
    publications: HashMap<String, Publication>,
    subscriptions: HashMap<String, Subscription>,
}

struct BrokerHandle {
    connection: Connection,
    channel: Arc<Channel>,
}

/// Declarative implementation of the messaging service contract.
#[derive(Clone)]
pub struct DeclarativeEngine {
    inner: Arc<DeclarativeInner>,
}

struct DeclarativeInner {
    config: AmqpConfig,
    options: EngineOptions,
    sink: Arc<dyn ErrorSink>,
    definition: RwLock<BrokerDefinition>,
    broker: Mutex<Option<BrokerHandle>>,
    stopped: AtomicBool,
}

impl DeclarativeEngine {
    pub fn new(config: AmqpConfig, options: EngineOptions, sink: Arc<dyn ErrorSink>) -> Self {
        DeclarativeEngine {
            inner: Arc::new(DeclarativeInner {
                config,
                options,
                sink,
                definition: RwLock::new(BrokerDefinition::default()),
                broker: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }
}

impl DeclarativeInner {
    /// Returns the broker channel, connecting and installing the whole
    /// accumulated definition first if necessary.
    async fn ensure_broker(&self) -> Result<Arc<Channel>, AmqpError> {
        let mut guard = self.broker.lock().await;

        if let Some(handle) = guard.as_ref() {
            if handle.connection.status().connected() {
                return Ok(handle.channel.clone());
            }
        }

        let conn = channel::connect_with_retry(
            &self.config,
            "broker",
            self.options.reconnect_delay,
            &self.stopped,
        )
        .await
        .ok_or(AmqpError::ConnectionError)?;

        let chan = Arc::new(channel::open_confirm_channel(&conn).await?);
        self.install_definition(&chan).await?;

        *guard = Some(BrokerHandle {
            connection: conn,
            channel: chan.clone(),
        });

        Ok(chan)
    }

    /// Asserts every exchange, queue, and binding in the definition.
    async fn install_definition(&self, chan: &Channel) -> Result<(), AmqpError> {
        let (exchanges, queues) = {
            let definition = self.definition.read().await;
            (
                definition
                    .exchanges
                    .iter()
                    .map(|(name, kind)| (name.clone(), kind.clone()))
                    .collect::<Vec<_>>(),
                definition
                    .queues
                    .iter()
                    .map(|(name, spec)| (name.clone(), spec.clone()))
                    .collect::<Vec<_>>(),
            )
        };

        debug!(
            exchanges = exchanges.len(),
            queues = queues.len(),
            "installing broker definition"
        );

        for (name, kind) in &exchanges {
            topology::declare_exchange(chan, name, kind).await?;
        }

        for (name, spec) in &queues {
            topology::declare_queue(chan, name).await?;
            topology::bind_queue(chan, name, &spec.exchange, &spec.binding_key).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl MessagingService for DeclarativeEngine {
    /// Records the exchange in the broker definition. No broker traffic
    /// happens until the definition is installed on first use.
    async fn init_publisher(&self, exchange_name: &str, exchange_kind: ExchangeKind) {
        let mut definition = self.inner.definition.write().await;
        definition
            .exchanges
            .insert(exchange_name.to_owned(), exchange_kind);
    }

    /// Records the queue, its binding, the matching publication, and the
    /// subscription in the broker definition.
    async fn init_consumer(
        &self,
        exchange_name: &str,
        exchange_kind: ExchangeKind,
        queue_name: &str,
        binding_key: &str,
        prefetch: u16,
    ) {
        let mut definition = self.inner.definition.write().await;

        definition
            .exchanges
            .insert(exchange_name.to_owned(), exchange_kind);
        definition.queues.insert(
            queue_name.to_owned(),
            QueueSpec {
                exchange: exchange_name.to_owned(),
                binding_key: binding_key.to_owned(),
            },
        );
        definition.publications.insert(
            publication_name(exchange_name, binding_key),
            Publication {
                exchange: exchange_name.to_owned(),
                routing_key: binding_key.to_owned(),
            },
        );
        definition
            .subscriptions
            .insert(queue_name.to_owned(), Subscription { prefetch });
    }

    /// Publishes through the named publication for the exchange/routing-key
    /// pair. An unknown publication is reported and the call still returns
    /// `true`; this variant has no outbox fallback.
    async fn publish(&self, exchange_name: &str, routing_key: &str, message: Value) -> bool {
        let name = publication_name(exchange_name, routing_key);

        let publication = {
            self.inner
                .definition
                .read()
                .await
                .publications
                .get(&name)
                .cloned()
        };

        let Some(publication) = publication else {
            error!(publication = name.as_str(), "publication does not exist");
            self.inner.sink.capture(
                &AmqpError::PublishingError,
                Some(HashMap::from([("publication".to_owned(), name)])),
            );
            return true;
        };

        let chan = match self.inner.ensure_broker().await {
            Ok(chan) => chan,
            Err(err) => {
                error!(error = err.to_string(), "failure to create the broker");
                self.inner.sink.capture(&err, None);
                return true;
            }
        };

        if let Err(err) = crate::publisher::publish_with_confirm(
            &chan,
            &publication.exchange,
            &publication.routing_key,
            &message,
        )
        .await
        {
            error!(
                error = err.to_string(),
                publication = publication_name(exchange_name, routing_key),
                "failure to publish"
            );
            self.inner.sink.capture(&err, None);
        }

        true
    }

    /// Subscribes the handler to a declared subscription. Rejected
    /// deliveries are nacked under the engine's deferred retry policy.
    async fn consume(&self, queue_name: &str, handler: Arc<dyn MessageHandler>) -> Option<String> {
        let subscription = {
            self.inner
                .definition
                .read()
                .await
                .subscriptions
                .get(queue_name)
                .cloned()
        };

        let Some(subscription) = subscription else {
            error!(queue = queue_name, "subscription does not exist");
            self.inner
                .sink
                .capture(&AmqpError::ConsumerError(queue_name.to_owned()), None);
            return None;
        };

        let chan = match self.inner.ensure_broker().await {
            Ok(chan) => chan,
            Err(err) => {
                error!(error = err.to_string(), "failure to create the broker");
                self.inner.sink.capture(&err, None);
                return None;
            }
        };

        if let Err(err) = topology::apply_prefetch(&chan, subscription.prefetch).await {
            self.inner.sink.capture(&err, None);
            return None;
        }

        let mut deliveries = match chan
            .basic_consume(
                queue_name,
                "",
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
            Ok(deliveries) => deliveries,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = queue_name,
                    "error to create the consumer"
                );
                self.inner
                    .sink
                    .capture(&AmqpError::SubscribeError(queue_name.to_owned()), None);
                return None;
            }
        };

        let tag = deliveries.tag().to_string();
        let sink = self.inner.sink.clone();
        let policy = self.inner.options.retry.clone();
        let queue = queue_name.to_owned();

        tokio::spawn(async move {
            while let Some(result) = deliveries.next().await {
                match result {
                    Ok(delivery) => {
                        if let Err(err) = consumer::process_delivery(
                            &delivery,
                            handler.as_ref(),
                            sink.as_ref(),
                            &policy,
                        )
                        .await
                        {
                            error!(error = err.to_string(), queue, "error to consume message");
                        }
                    }
                    Err(err) => {
                        error!(error = err.to_string(), queue, "consumer stream error");
                    }
                }
            }

            info!(queue, "consumer subscription ended");
        });

        Some(tag)
    }

    async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);

        let broker = self.inner.broker.lock().await.take();

        if let Some(handle) = broker {
            if let Err(err) = handle.connection.close(REPLY_SUCCESS, "shutdown").await {
                error!(
                    error = err.to_string(),
                    "failure to close connection gracefully"
                );
            }
        }

        info!("declarative engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::LogSink;
    use serde_json::json;

    fn test_engine() -> DeclarativeEngine {
        DeclarativeEngine::new(
            AmqpConfig::default(),
            EngineOptions::default(),
            Arc::new(LogSink),
        )
    }

    #[test]
    fn publication_names_scope_on_the_routing_key() {
        assert_eq!(publication_name("video_job", ""), "video_job");
        assert_eq!(
            publication_name("video_manager", "general"),
            "video_manager_general"
        );
    }

    #[tokio::test]
    async fn repeated_registration_keeps_single_entries() {
        let engine = test_engine();

        for _ in 0..2 {
            engine
                .init_consumer("video_job", ExchangeKind::Direct, "job_queue", "general", 1)
                .await;
            engine.init_publisher("video_job", ExchangeKind::Direct).await;
        }

        let definition = engine.inner.definition.read().await;
        assert_eq!(definition.exchanges.len(), 1);
        assert_eq!(definition.queues.len(), 1);
        assert_eq!(definition.publications.len(), 1);
        assert_eq!(definition.subscriptions.len(), 1);
    }

    #[tokio::test]
    async fn publish_to_unknown_publication_is_still_accepted() {
        let engine = test_engine();

        // the publication lookup fails before any broker traffic happens
        let accepted = engine
            .publish("video_job", "created", json!({ "job": 1 }))
            .await;

        assert!(accepted);
    }

    #[tokio::test]
    async fn consume_on_unknown_subscription_returns_none() {
        let engine = test_engine();

        let handler: Arc<dyn MessageHandler> = Arc::new(|_message: Value| async move {
            Ok::<bool, crate::handler::HandlerError>(true)
        });

        assert!(engine.consume("job_queue", handler).await.is_none());
    }

    #[tokio::test]
    async fn consumer_registration_records_binding_and_prefetch() {
        let engine = test_engine();

        engine
            .init_consumer(
                "video_manager",
                ExchangeKind::Topic,
                "video_manager_queue",
                "general",
                10,
            )
            .await;

        let definition = engine.inner.definition.read().await;
        let spec = definition.queues.get("video_manager_queue").unwrap();
        assert_eq!(spec.exchange, "video_manager");
        assert_eq!(spec.binding_key, "general");
        assert_eq!(
            definition
                .subscriptions
                .get("video_manager_queue")
                .unwrap()
                .prefetch,
            10
        );
        assert!(definition
            .publications
            .contains_key("video_manager_general"));
    }
}
