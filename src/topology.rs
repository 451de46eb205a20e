// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Registry
//!
//! The in-memory bookkeeping of everything the engine has declared on the
//! broker: publisher channels per exchange, queue settings per queue, and
//! consumer handlers per queue. This registry is the source of truth
//! replayed by the reconnection coordinator after a broker outage, so
//! entries are only ever replaced by re-registration, never removed.
//!
//! The declare helpers apply the engine's fixed topology policy: durable,
//! non-auto-delete exchanges and durable, non-exclusive, non-auto-delete
//! queues, asserted if missing.

use crate::{errors::AmqpError, exchange::ExchangeKind, handler::MessageHandler};
use lapin::{
    options::{BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error};

/// A publisher-side exchange registration: the confirm channel that
/// publishes to it and the kind needed to re-declare it on reconnect.
#[derive(Clone)]
pub(crate) struct PublisherRegistration {
    pub kind: ExchangeKind,
    pub channel: Arc<Channel>,
}

/// A consumer-side queue registration with everything needed to re-declare,
/// rebind, and re-apply fair dispatch on reconnect.
#[derive(Clone)]
pub(crate) struct QueueRegistration {
    pub exchange: String,
    pub kind: ExchangeKind,
    pub binding_key: String,
    pub prefetch: u16,
    pub channel: Arc<Channel>,
}

/// A registered consumer: the caller's handler and, once subscribed, the
/// broker-assigned consumer tag.
#[derive(Clone)]
pub(crate) struct ConsumerRegistration {
    pub handler: Arc<dyn MessageHandler>,
    pub tag: Option<String>,
}

/// The full registered topology, keyed by exchange and queue names.
#[derive(Default)]
pub(crate) struct TopologyRegistry {
    pub publishers: HashMap<String, PublisherRegistration>,
    pub queues: HashMap<String, QueueRegistration>,
    pub consumers: HashMap<String, ConsumerRegistration>,
}

/// Declares an exchange with the engine's fixed policy.
pub(crate) async fn declare_exchange(
    channel: &Channel,
    name: &str,
    kind: &ExchangeKind,
) -> Result<(), AmqpError> {
    debug!(name, "creating exchange");

    match channel
        .exchange_declare(
            name,
            lapin::ExchangeKind::from(kind.clone()),
            ExchangeDeclareOptions {
                passive: false,
                durable: true,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name, "error to declare the exchange"
            );
            Err(AmqpError::DeclareExchangeError(name.to_owned()))
        }
        _ => Ok(()),
    }
}

/// Declares a queue with the engine's fixed policy.
pub(crate) async fn declare_queue(channel: &Channel, name: &str) -> Result<(), AmqpError> {
    debug!(name, "creating queue");

    match channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name, "error to declare the queue");
            Err(AmqpError::DeclareQueueError(name.to_owned()))
        }
        _ => Ok(()),
    }
}

/// Binds a queue to an exchange on the given binding key.
pub(crate) async fn bind_queue(
    channel: &Channel,
    queue: &str,
    exchange: &str,
    binding_key: &str,
) -> Result<(), AmqpError> {
    debug!(
        queue,
        exchange, binding_key, "binding queue to the exchange"
    );

    match channel
        .queue_bind(
            queue,
            exchange,
            binding_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                "error to bind queue to exchange"
            );
            Err(AmqpError::BindingError(
                queue.to_owned(),
                exchange.to_owned(),
            ))
        }
        _ => Ok(()),
    }
}

/// Applies the prefetch/fair-dispatch limit on a consumer channel.
pub(crate) async fn apply_prefetch(channel: &Channel, prefetch: u16) -> Result<(), AmqpError> {
    match channel
        .basic_qos(prefetch, BasicQosOptions { global: false })
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), prefetch, "error to configure qos");
            Err(AmqpError::QoSDeclarationError(prefetch.to_string()))
        }
        _ => Ok(()),
    }
}
