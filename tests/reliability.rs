// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! End-to-end tests against a live RabbitMQ broker.
//!
//! These are ignored by default; run them with a local broker (for example
//! `docker run -p 5672:5672 rabbitmq:3`) via `cargo test -- --ignored`.
//! The broker location is taken from the `AMQP_*` environment variables.

use relmq::{
    config::{AmqpConfig, EngineOptions},
    engine::AmqpEngine,
    exchange::ExchangeKind,
    handler::{HandlerError, MessageHandler},
    outbox::InMemoryOutbox,
    service::MessagingService,
    sink::LogSink,
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

fn test_engine(outbox: Arc<InMemoryOutbox>, resend_interval: Duration) -> AmqpEngine {
    AmqpEngine::new(
        AmqpConfig::from_env(),
        EngineOptions {
            resend_interval,
            ..EngineOptions::default()
        },
        outbox,
        Arc::new(LogSink),
    )
}

fn collecting_handler(tx: mpsc::UnboundedSender<Value>) -> Arc<dyn MessageHandler> {
    Arc::new(move |message: Value| {
        let tx = tx.clone();
        async move {
            tx.send(message).ok();
            Ok::<bool, HandlerError>(true)
        }
    })
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn publish_and_consume_round_trip() {
    init_tracing();

    let suffix = Uuid::new_v4().simple().to_string();
    let exchange = format!("relmq_e2e_{suffix}");
    let queue = format!("relmq_e2e_queue_{suffix}");

    let engine = test_engine(Arc::new(InMemoryOutbox::new()), Duration::from_secs(5));

    engine.init_publisher(&exchange, ExchangeKind::Direct).await;
    engine
        .init_consumer(&exchange, ExchangeKind::Direct, &queue, "general", 1)
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let tag = engine.consume(&queue, collecting_handler(tx)).await;
    assert!(tag.is_some());

    let accepted = engine
        .publish(&exchange, "general", json!({ "job": "encode", "id": 1 }))
        .await;
    assert!(accepted);

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no delivery within timeout")
        .expect("delivery stream closed");
    assert_eq!(received, json!({ "job": "encode", "id": 1 }));

    engine.stop().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn repeated_registration_is_accepted_by_the_broker() {
    init_tracing();

    let suffix = Uuid::new_v4().simple().to_string();
    let exchange = format!("relmq_e2e_{suffix}");
    let queue = format!("relmq_e2e_queue_{suffix}");

    let engine = test_engine(Arc::new(InMemoryOutbox::new()), Duration::from_secs(5));

    for _ in 0..2 {
        engine.init_publisher(&exchange, ExchangeKind::Direct).await;
        engine
            .init_consumer(&exchange, ExchangeKind::Direct, &queue, "general", 1)
            .await;
    }

    assert!(engine.publish(&exchange, "general", json!(1)).await);

    engine.stop().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn outbox_drains_once_the_exchange_is_registered() {
    init_tracing();

    let suffix = Uuid::new_v4().simple().to_string();
    let exchange = format!("relmq_e2e_{suffix}");
    let queue = format!("relmq_e2e_queue_{suffix}");

    let outbox = Arc::new(InMemoryOutbox::new());
    let engine = test_engine(outbox.clone(), Duration::from_secs(1));

    // publishing before any registration parks the message in the outbox
    assert!(engine.publish(&exchange, "general", json!({ "seq": 1 })).await);
    assert_eq!(outbox.len().await, 1);

    // bind the queue before the publisher side exists so the resend cannot
    // race the binding
    engine
        .init_consumer(&exchange, ExchangeKind::Direct, &queue, "general", 1)
        .await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.consume(&queue, collecting_handler(tx)).await;

    engine.init_publisher(&exchange, ExchangeKind::Direct).await;

    // the resend loop armed by the publisher connect drains the outbox
    let received = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("outbox message was not resent")
        .expect("delivery stream closed");
    assert_eq!(received, json!({ "seq": 1 }));
    assert!(outbox.is_empty().await);

    engine.stop().await;
}
