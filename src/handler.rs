// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Message Handlers
//!
//! The callback contract between the engine and its callers. A handler
//! receives the decoded JSON payload and decides the fate of the delivery:
//! `Ok(true)` acknowledges it, `Ok(false)` or an error rejects it.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;

/// Errors raised by consumer handlers.
///
/// Handler failures never propagate past the consumption boundary; they are
/// logged, reported to the error sink, and turned into a nack.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes a single delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Returns `Ok(true)` to acknowledge the message, `Ok(false)` or `Err`
    /// to reject it. Rejected messages are redelivered or dead-lettered per
    /// broker policy; the engine adds no backoff of its own.
    async fn handle(&self, message: Value) -> Result<bool, HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: Value) -> Result<bool, HandlerError> {
        (self)(message).await
    }
}
