//! Channel layer contract.
//!
//! This module contains:
//! - `ChannelLayer` trait: the operation surface used by worker frameworks
//! - `LayerError`: the error taxonomy shared by every implementation
//! - `Message`/`Received`: payload types
//! - `layer_from_config`: factory picking the implementation from config

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;

use crate::amqp::AmqpChannelLayer;
use crate::config::LayerConfig;
use crate::hybrid::HybridChannelLayer;

// ============================================================================
// Types
// ============================================================================

/// A message is a string-keyed mapping of JSON values.
pub type Message = Map<String, Value>;

/// Outcome of a receive: both halves are `None` when nothing was ready.
pub type Received = (Option<String>, Option<Message>);

/// Result type for layer operations.
pub type Result<T> = std::result::Result<T, LayerError>;

/// Errors that can occur during layer operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayerError {
    /// The channel holds as many undelivered messages as its capacity allows.
    #[error("Channel '{channel}' is full")]
    ChannelFull { channel: String },

    /// The broker connection is gone. The layer instance must be recreated.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// No configured key could decrypt the payload.
    #[error("Undecryptable payload: {0}")]
    UndecryptablePayload(String),

    /// Mutually exclusive components were combined.
    #[error("Configuration conflict: {0}")]
    ConfigurationConflict(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Unexpected broker reply that did not close the connection.
    #[error("Broker protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LayerError {
    /// Capacity errors are the only ones callers are expected to retry.
    pub fn is_channel_full(&self) -> bool {
        matches!(self, LayerError::ChannelFull { .. })
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, LayerError::ConnectionClosed(_))
    }
}

/// Optional capabilities advertised by a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    /// `group_add`, `group_discard` and `send_group`.
    Groups,
    /// `flush` removes everything the layer created.
    Flush,
}

// ============================================================================
// Traits
// ============================================================================

/// Interface for exchanging messages by channel name.
///
/// Implementations:
/// - `AmqpChannelLayer`: every channel lives on RabbitMQ
/// - `HybridChannelLayer`: reply channels on RabbitMQ, the rest in-process
///
/// All methods block the calling thread. None of them may be called from
/// inside an async runtime worker; use `AmqpChannelLayer::receive_async`
/// there.
pub trait ChannelLayer: Send + Sync {
    /// Send a message to a channel.
    ///
    /// Fails with `ChannelFull` when the channel already holds its capacity
    /// of undelivered messages. Nothing is queued in that case.
    fn send(&self, channel: &str, message: &Message) -> Result<()>;

    /// Take the first available message from `channels`, in the given order.
    ///
    /// With `block` set, waits until a message arrives or the configured
    /// receive timeout elapses.
    fn receive(&self, channels: &[&str], block: bool) -> Result<Received>;

    /// Create a fresh channel name from a pattern ending in `!` or `?`.
    fn new_channel(&self, pattern: &str) -> Result<String>;

    /// Create the topology for a channel ahead of its first use.
    fn declare_channel(&self, channel: &str) -> Result<()>;

    /// Add a channel to a group. Idempotent; refreshes the membership expiry.
    fn group_add(&self, group: &str, channel: &str) -> Result<()>;

    /// Remove a channel from a group. No-op if it is not a member.
    fn group_discard(&self, group: &str, channel: &str) -> Result<()>;

    /// Send one message to every current member of a group.
    fn send_group(&self, group: &str, message: &Message) -> Result<()>;

    /// Delete every channel, group and pending message this layer created.
    fn flush(&self) -> Result<()>;

    fn extensions(&self) -> &'static [Extension] {
        &[Extension::Groups, Extension::Flush]
    }

    /// Broker-backed layers expose their AMQP half for topology hooks.
    fn as_amqp(&self) -> Option<&AmqpChannelLayer> {
        None
    }

    fn is_broker_backed(&self) -> bool {
        self.as_amqp().is_some()
    }

    /// Whether this layer keeps `channel` in process memory even though it
    /// has a broker half.
    fn serves_locally(&self, _channel: &str) -> bool {
        false
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Build the layer selected by `config.hybrid`.
pub fn layer_from_config(config: LayerConfig) -> Result<Arc<dyn ChannelLayer>> {
    if config.hybrid {
        let layer = HybridChannelLayer::new(config)?;
        info!(layer = "hybrid", "Channel layer initialized");
        Ok(Arc::new(layer))
    } else {
        let layer = AmqpChannelLayer::new(config)?;
        info!(layer = "amqp", "Channel layer initialized");
        Ok(Arc::new(layer))
    }
}
