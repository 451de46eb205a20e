// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error-Reporting Sink
//!
//! Fire-and-forget error reporting, the seam where an external tracker
//! (Sentry and the like) plugs in. The engine reports every swallowed
//! failure here so silent no-ops still leave a trace outside the logs.

use crate::errors::AmqpError;
use std::collections::HashMap;
use tracing::error;

#[cfg(test)]
use mockall::automock;

/// Destination for captured errors.
///
/// Implementations must never fail or block: `capture` is called from hot
/// paths and from contexts where a second failure has nowhere to go.
#[cfg_attr(test, automock)]
pub trait ErrorSink: Send + Sync {
    fn capture(&self, error: &AmqpError, tags: Option<HashMap<String, String>>);
}

/// Default sink that forwards captures to the structured log.
pub struct LogSink;

impl ErrorSink for LogSink {
    fn capture(&self, error: &AmqpError, tags: Option<HashMap<String, String>>) {
        match tags {
            Some(tags) => error!(error = error.to_string(), ?tags, "captured error"),
            None => error!(error = error.to_string(), "captured error"),
        }
    }
}
