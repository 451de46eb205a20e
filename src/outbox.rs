// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Outbox Store
//!
//! Durable, ordered storage for messages that failed immediate delivery.
//! The resend loop drains this store back through the publisher engine.
//!
//! The store is an external collaborator behind the [`Outbox`] trait so a
//! database-backed implementation can hold messages across process restarts.
//! [`InMemoryOutbox`] is the fallback used when no persistence is wired in,
//! and the default for tests.

use crate::errors::AmqpError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tokio::sync::Mutex;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// A message that could not be delivered and awaits resend.
///
/// Ordering is FIFO by enqueue time. Uniqueness is not required: under
/// at-least-once semantics a duplicate resend is acceptable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub exchange: String,
    pub routing_key: String,
    pub content: Value,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboxMessage {
    pub fn new(exchange: &str, routing_key: &str, content: Value) -> Self {
        OutboxMessage {
            id: Uuid::new_v4(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            content,
            enqueued_at: Utc::now(),
        }
    }
}

/// Storage contract for undeliverable messages.
///
/// `dequeue_oldest` removes the returned message from the store; the caller
/// owns it from that point and must re-enqueue it if the dispatch attempt
/// cannot proceed. `requeue_front` exists for exactly that case: a dequeued
/// message whose exchange is not registered yet goes back to the head so
/// drain order is preserved.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Appends a message at the tail of the store.
    async fn enqueue(&self, message: OutboxMessage) -> Result<(), AmqpError>;

    /// Removes and returns the oldest message, if any.
    async fn dequeue_oldest(&self) -> Result<Option<OutboxMessage>, AmqpError>;

    /// Puts a message back at the head of the store.
    async fn requeue_front(&self, message: OutboxMessage) -> Result<(), AmqpError>;
}

/// In-memory outbox, the fallback when persistence is unavailable.
///
/// Messages held here do not survive a process restart; they do survive
/// broker outages, which is the common failure this engine exists for.
#[derive(Default)]
pub struct InMemoryOutbox {
    messages: Mutex<VecDeque<OutboxMessage>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        InMemoryOutbox::default()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }
}

#[async_trait]
impl Outbox for InMemoryOutbox {
    async fn enqueue(&self, message: OutboxMessage) -> Result<(), AmqpError> {
        self.messages.lock().await.push_back(message);
        Ok(())
    }

    async fn dequeue_oldest(&self) -> Result<Option<OutboxMessage>, AmqpError> {
        Ok(self.messages.lock().await.pop_front())
    }

    async fn requeue_front(&self, message: OutboxMessage) -> Result<(), AmqpError> {
        self.messages.lock().await.push_front(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn drains_in_enqueue_order() {
        let outbox = InMemoryOutbox::new();
        for n in 0..3 {
            outbox
                .enqueue(OutboxMessage::new("video_job", "created", json!({ "n": n })))
                .await
                .unwrap();
        }

        for n in 0..3 {
            let message = outbox.dequeue_oldest().await.unwrap().unwrap();
            assert_eq!(message.content, json!({ "n": n }));
        }
        assert!(outbox.dequeue_oldest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_removes_the_message() {
        let outbox = InMemoryOutbox::new();
        outbox
            .enqueue(OutboxMessage::new("video_job", "created", json!(1)))
            .await
            .unwrap();

        assert!(outbox.dequeue_oldest().await.unwrap().is_some());
        assert!(outbox.is_empty().await);
    }

    #[tokio::test]
    async fn requeue_front_restores_head_position() {
        let outbox = InMemoryOutbox::new();
        outbox
            .enqueue(OutboxMessage::new("video_job", "created", json!("first")))
            .await
            .unwrap();
        outbox
            .enqueue(OutboxMessage::new("download_message", "done", json!("second")))
            .await
            .unwrap();

        let head = outbox.dequeue_oldest().await.unwrap().unwrap();
        outbox.requeue_front(head.clone()).await.unwrap();

        let again = outbox.dequeue_oldest().await.unwrap().unwrap();
        assert_eq!(again, head);
        assert_eq!(outbox.len().await, 1);
    }

    #[test]
    fn new_message_carries_an_enqueue_timestamp() {
        let before = Utc::now();
        let message = OutboxMessage::new("video_job", "created", json!({}));
        assert!(message.enqueued_at >= before);
        assert_eq!(message.exchange, "video_job");
        assert_eq!(message.routing_key, "created");
    }
}
