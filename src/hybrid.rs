//! Hybrid channel layer.
//!
//! Reply channels (names containing `!`) may be read by a worker in another
//! process, so they live on RabbitMQ. Every other channel is read only by this
//! process and lives in [`LocalChannels`], skipping the broker round-trip.
//!
//! Groups always live on the broker. When a local channel joins a group its
//! name is remembered as bridged, and receives on it also poll its broker
//! queue for group deliveries.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::amqp::AmqpChannelLayer;
use crate::codec::MessageCodec;
use crate::config::LayerConfig;
use crate::layer::{ChannelLayer, LayerError, Message, Received, Result};
use crate::local::LocalChannels;
use crate::naming::{self, ChannelKind};
use crate::utils::retry::poll_blocking;

/// Whether a channel must be reachable from other processes.
pub fn is_broker_channel(channel: &str) -> bool {
    ChannelKind::of(channel) == ChannelKind::SingleReader
}

/// Channel layer splitting traffic between RabbitMQ and process memory.
#[derive(Debug)]
pub struct HybridChannelLayer {
    broker: AmqpChannelLayer,
    local: Arc<LocalChannels>,
    local_codec: MessageCodec,
    receive_timeout: Duration,
}

impl HybridChannelLayer {
    /// Connect to the broker and start the local store's reaper.
    pub fn new(config: LayerConfig) -> Result<Self> {
        let local = Arc::new(LocalChannels::new(
            config.capacity_rules()?,
            config.message_ttl(),
        ));
        let receive_timeout = config.receive_timeout();
        let broker = AmqpChannelLayer::new(config)?;

        local
            .spawn_reaper()
            .map_err(|e| LayerError::Config(format!("Failed to start reaper: {}", e)))?;

        info!("Hybrid channel layer ready");
        Ok(Self {
            broker,
            local,
            local_codec: MessageCodec::plain(),
            receive_timeout,
        })
    }

    /// The in-process half.
    pub fn local(&self) -> &LocalChannels {
        &self.local
    }

    /// One pass: local channels first, then broker and bridged channels.
    fn poll_once(&self, channels: &[&str]) -> Result<Option<(String, Message)>> {
        let local: Vec<&str> = channels
            .iter()
            .copied()
            .filter(|c| !is_broker_channel(c))
            .collect();
        if let Some((channel, body)) = self.local.receive(&local) {
            return Ok(Some((channel, self.local_codec.decode(&body)?)));
        }

        let remote: Vec<String> = channels
            .iter()
            .filter(|c| is_broker_channel(c) || self.local.is_bridged(c))
            .map(|c| c.to_string())
            .collect();
        if remote.is_empty() {
            return Ok(None);
        }
        match self.broker.poll_raw(&remote)? {
            Some((channel, body)) => Ok(Some((channel, self.broker.codec().decode(&body)?))),
            None => Ok(None),
        }
    }
}

impl ChannelLayer for HybridChannelLayer {
    #[tracing::instrument(name = "layer.send", skip_all, fields(%channel))]
    fn send(&self, channel: &str, message: &Message) -> Result<()> {
        if is_broker_channel(channel) {
            return self.broker.send(channel, message);
        }
        naming::validate_channel(channel)?;
        let body = self.local_codec.encode(message)?;
        self.local.send(channel, body)
    }

    #[tracing::instrument(name = "layer.receive", skip_all, fields(channels = channels.len(), block = block))]
    fn receive(&self, channels: &[&str], block: bool) -> Result<Received> {
        for channel in channels {
            naming::validate_channel(channel)?;
        }
        if channels.is_empty() {
            return Ok((None, None));
        }

        let received = if block {
            poll_blocking(self.receive_timeout, || self.poll_once(channels))?
        } else {
            self.poll_once(channels)?
        };
        Ok(match received {
            Some((channel, message)) => (Some(channel), Some(message)),
            None => (None, None),
        })
    }

    /// Generated names always come from the broker so they can join groups.
    fn new_channel(&self, pattern: &str) -> Result<String> {
        self.broker.new_channel(pattern)
    }

    fn declare_channel(&self, channel: &str) -> Result<()> {
        if is_broker_channel(channel) {
            return self.broker.declare_channel(channel);
        }
        naming::validate_channel(channel)
    }

    fn group_add(&self, group: &str, channel: &str) -> Result<()> {
        self.broker.group_add(group, channel)?;
        if !is_broker_channel(channel) {
            debug!(group = %group, channel = %channel, "Bridging local channel to group");
            self.local.mark_bridged(channel, group);
        }
        Ok(())
    }

    fn group_discard(&self, group: &str, channel: &str) -> Result<()> {
        self.broker.group_discard(group, channel)?;
        self.local.unmark_bridged(channel, group);
        Ok(())
    }

    fn send_group(&self, group: &str, message: &Message) -> Result<()> {
        self.broker.send_group(group, message)
    }

    fn flush(&self) -> Result<()> {
        self.local.clear();
        self.broker.flush()
    }

    fn as_amqp(&self) -> Option<&AmqpChannelLayer> {
        Some(&self.broker)
    }

    fn serves_locally(&self, channel: &str) -> bool {
        !is_broker_channel(channel)
    }
}
