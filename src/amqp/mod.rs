//! RabbitMQ channel layer.
//!
//! Every channel is a queue; every group is a fanout exchange. All broker
//! traffic runs on one connection owned by a dedicated thread (see
//! [`connection`]); layer methods encode on the calling thread, schedule a
//! command and wait for its reply.

mod connection;
pub mod membership;
mod session;
mod topology;

pub use connection::Pending;

use std::time::Duration;

use tracing::{debug, info};

use crate::codec::MessageCodec;
use crate::config::LayerConfig;
use crate::layer::{ChannelLayer, Message, Received, Result};
use crate::naming;
use crate::utils::retry::{poll_async, poll_blocking};
use connection::{Command, ConnectionThread, Delivery};
use session::SessionSettings;

/// Channel layer backed entirely by RabbitMQ.
#[derive(Debug)]
pub struct AmqpChannelLayer {
    connection: ConnectionThread,
    codec: MessageCodec,
    receive_timeout: Duration,
}

impl AmqpChannelLayer {
    /// Connect to the broker named in `config.url`.
    ///
    /// Blocks until the connection is up. Must not be called from inside an
    /// async runtime.
    pub fn new(config: LayerConfig) -> Result<Self> {
        config.validate()?;
        let codec = MessageCodec::with_keys(&config.symmetric_encryption_keys)?;
        let settings = SessionSettings::from_config(&config)?;
        let connection = ConnectionThread::start(settings)?;

        info!(
            encrypted = codec.is_encrypted(),
            receive_timeout_ms = config.receive_timeout_ms,
            "AMQP channel layer ready"
        );

        Ok(Self {
            connection,
            codec,
            receive_timeout: config.receive_timeout(),
        })
    }

    /// Close the broker connection. Later calls fail with `ConnectionClosed`.
    pub fn close(&self) -> Result<()> {
        self.connection.close()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.scheduler().is_closed()
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    // ------------------------------------------------------------------------
    // Raw operations shared with the hybrid layer
    // ------------------------------------------------------------------------

    pub(crate) fn send_raw(&self, channel: &str, body: Vec<u8>) -> Result<()> {
        self.connection
            .scheduler()
            .schedule(|reply| Command::Send {
                channel: channel.to_string(),
                body,
                reply,
            })
            .wait()
    }

    /// One non-blocking pass over `channels`.
    pub(crate) fn poll_raw(&self, channels: &[String]) -> Result<Option<Delivery>> {
        self.schedule_receive(channels).wait()
    }

    fn schedule_receive(&self, channels: &[String]) -> Pending<Option<Delivery>> {
        self.connection
            .scheduler()
            .schedule(|reply| Command::Receive {
                channels: channels.to_vec(),
                reply,
            })
    }

    fn decode(&self, delivery: Option<Delivery>) -> Result<Received> {
        match delivery {
            Some((channel, body)) => {
                let message = self.codec.decode(&body)?;
                Ok((Some(channel), Some(message)))
            }
            None => Ok((None, None)),
        }
    }

    fn validated(channels: &[&str]) -> Result<Vec<String>> {
        channels
            .iter()
            .map(|channel| {
                naming::validate_channel(channel)?;
                Ok(channel.to_string())
            })
            .collect()
    }

    /// Receive without blocking a runtime thread.
    ///
    /// Same semantics as [`ChannelLayer::receive`], for async callers.
    pub async fn receive_async(&self, channels: &[&str], block: bool) -> Result<Received> {
        let channels = Self::validated(channels)?;
        if channels.is_empty() {
            return Ok((None, None));
        }
        let delivery = if block {
            let channels: &[String] = &channels;
            poll_async(self.receive_timeout, || self.schedule_receive(channels)).await?
        } else {
            self.schedule_receive(&channels).await?
        };
        self.decode(delivery)
    }
}

impl ChannelLayer for AmqpChannelLayer {
    #[tracing::instrument(name = "layer.send", skip_all, fields(%channel))]
    fn send(&self, channel: &str, message: &Message) -> Result<()> {
        naming::validate_channel(channel)?;
        let body = self.codec.encode(message)?;
        self.send_raw(channel, body)
    }

    #[tracing::instrument(name = "layer.receive", skip_all, fields(channels = channels.len(), block = block))]
    fn receive(&self, channels: &[&str], block: bool) -> Result<Received> {
        let channels = Self::validated(channels)?;
        if channels.is_empty() {
            return Ok((None, None));
        }
        let delivery = if block {
            poll_blocking(self.receive_timeout, || self.poll_raw(&channels))?
        } else {
            self.poll_raw(&channels)?
        };
        if delivery.is_none() && block {
            debug!(timeout_ms = self.receive_timeout.as_millis() as u64, "Blocking receive timed out");
        }
        self.decode(delivery)
    }

    fn new_channel(&self, pattern: &str) -> Result<String> {
        naming::validate_pattern(pattern)?;
        self.connection
            .scheduler()
            .schedule(|reply| Command::NewChannel {
                pattern: pattern.to_string(),
                reply,
            })
            .wait()
    }

    fn declare_channel(&self, channel: &str) -> Result<()> {
        naming::validate_channel(channel)?;
        self.connection
            .scheduler()
            .schedule(|reply| Command::DeclareChannel {
                channel: channel.to_string(),
                reply,
            })
            .wait()
    }

    #[tracing::instrument(name = "layer.group_add", skip_all, fields(%group, %channel))]
    fn group_add(&self, group: &str, channel: &str) -> Result<()> {
        naming::validate_group(group)?;
        naming::validate_channel(channel)?;
        self.connection
            .scheduler()
            .schedule(|reply| Command::GroupAdd {
                group: group.to_string(),
                channel: channel.to_string(),
                reply,
            })
            .wait()
    }

    #[tracing::instrument(name = "layer.group_discard", skip_all, fields(%group, %channel))]
    fn group_discard(&self, group: &str, channel: &str) -> Result<()> {
        naming::validate_group(group)?;
        naming::validate_channel(channel)?;
        self.connection
            .scheduler()
            .schedule(|reply| Command::GroupDiscard {
                group: group.to_string(),
                channel: channel.to_string(),
                reply,
            })
            .wait()
    }

    #[tracing::instrument(name = "layer.send_group", skip_all, fields(%group))]
    fn send_group(&self, group: &str, message: &Message) -> Result<()> {
        naming::validate_group(group)?;
        let body = self.codec.encode(message)?;
        self.connection
            .scheduler()
            .schedule(|reply| Command::SendGroup {
                group: group.to_string(),
                body,
                reply,
            })
            .wait()
    }

    fn flush(&self) -> Result<()> {
        self.connection
            .scheduler()
            .schedule(|reply| Command::Flush { reply })
            .wait()
    }

    fn as_amqp(&self) -> Option<&AmqpChannelLayer> {
        Some(self)
    }
}
