// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module handles the establishment of AMQP connections and channels.
//! The engine keeps two independent connections, one per role, so consumer
//! acknowledgement backpressure can never stall outbound publishing.
//!
//! Connecting retries forever with a fixed delay: the engine favors
//! availability over bounded startup time, so a connect call only returns
//! once the broker accepted the connection or the engine was stopped.

use crate::{config::AmqpConfig, errors::AmqpError};
use lapin::{
    options::ConfirmSelectOptions, types::LongString, Channel, Connection, ConnectionProperties,
};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tracing::{debug, error};

/// The role a broker connection serves.
///
/// Publisher-side and consumer-side traffic is kept on separate connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Publisher,
    Consumer,
}

impl ConnectionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionRole::Publisher => "publisher",
            ConnectionRole::Consumer => "consumer",
        }
    }
}

/// Connects to the broker, retrying forever.
///
/// The label distinguishes the connection in logs and in the broker
/// management UI; the engine passes the connection role, the declarative
/// variant its single shared broker connection.
///
/// Each failed attempt is logged and followed by a fixed `retry_delay`
/// sleep. The loop observes `stopped` between attempts so a shutdown can
/// cancel an in-flight connect cycle; in that case `None` is returned.
/// This function never returns an error.
pub(crate) async fn connect_with_retry(
    cfg: &AmqpConfig,
    label: &str,
    retry_delay: Duration,
    stopped: &AtomicBool,
) -> Option<Connection> {
    loop {
        if stopped.load(Ordering::SeqCst) {
            return None;
        }

        debug!(label, "creating amqp connection...");

        let options = ConnectionProperties::default().with_connection_name(LongString::from(
            format!("{}-{}", cfg.connection_name, label),
        ));

        match Connection::connect(&cfg.uri(), options).await {
            Ok(conn) => {
                debug!(label, "amqp connected");
                return Some(conn);
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    label,
                    delay_secs = retry_delay.as_secs(),
                    "failure to connect, will retry"
                );
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

/// Creates a plain channel on the given connection.
pub(crate) async fn open_channel(conn: &Connection) -> Result<Channel, AmqpError> {
    match conn.create_channel().await {
        Ok(channel) => Ok(channel),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}

/// Creates a channel in confirm mode, used for all publishing.
///
/// Every publish on such a channel is tracked by the broker confirmation
/// mechanism, which is what the outbox fallback keys off.
pub(crate) async fn open_confirm_channel(conn: &Connection) -> Result<Channel, AmqpError> {
    let channel = open_channel(conn).await?;

    match channel
        .confirm_select(ConfirmSelectOptions { nowait: false })
        .await
    {
        Ok(()) => Ok(channel),
        Err(err) => {
            error!(error = err.to_string(), "error to enable publisher confirms");
            Err(AmqpError::ChannelError)
        }
    }
}

/// Classifies a connection-level error as fatal or not.
///
/// Fatal errors are the ones that mean the connection is gone and a
/// reconnect cycle must run: transport I/O failures and protocol errors.
/// State errors raised by operations on an already-closing connection are
/// not an outage signal on their own.
pub(crate) fn is_fatal(err: &lapin::Error) -> bool {
    matches!(err, lapin::Error::IOError(_) | lapin::Error::ProtocolError(_))
}
