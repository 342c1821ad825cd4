//! Test utilities.
//!
//! This module provides an in-memory channel layer and the harness selection
//! used by test suites that run either against a broker or in process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::codec::MessageCodec;
use crate::config::{CapacityRules, LayerConfig};
use crate::layer::{layer_from_config, ChannelLayer, LayerError, Message, Received, Result};
use crate::local::LocalChannels;
use crate::naming;
use crate::utils::retry::poll_blocking;

// ============================================================================
// In-memory layer
// ============================================================================

/// Channel layer that keeps everything in process memory.
///
/// Honors capacity, message expiry and membership expiry. A channel whose
/// message expired unread leaves every group, as on the broker. Generated
/// names use a random UUID suffix.
#[derive(Debug)]
pub struct InMemoryLayer {
    channels: LocalChannels,
    /// group -> member -> membership deadline
    groups: Mutex<HashMap<String, HashMap<String, Instant>>>,
    codec: MessageCodec,
    membership_ttl: Duration,
    receive_timeout: Duration,
}

impl Default for InMemoryLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLayer {
    pub fn new() -> Self {
        let config = LayerConfig::default();
        Self::from_parts(&config, CapacityRules::uniform(config.capacity), MessageCodec::plain())
    }

    /// Layer with the capacity, expiry and encryption settings of `config`.
    pub fn with_config(config: &LayerConfig) -> Result<Self> {
        config.validate()?;
        let rules = config.capacity_rules()?;
        let codec = MessageCodec::with_keys(&config.symmetric_encryption_keys)?;
        Ok(Self::from_parts(config, rules, codec))
    }

    fn from_parts(config: &LayerConfig, rules: CapacityRules, codec: MessageCodec) -> Self {
        Self {
            channels: LocalChannels::new(rules, config.message_ttl()).tracking_expired(),
            groups: Mutex::new(HashMap::new()),
            codec,
            membership_ttl: config.membership_ttl(),
            receive_timeout: config.receive_timeout(),
        }
    }

    /// Remove channels that lost a message to expiry from every group.
    fn forget_expired_receivers(&self, groups: &mut HashMap<String, HashMap<String, Instant>>) {
        self.channels.purge_expired();
        for channel in self.channels.take_expired() {
            for members in groups.values_mut() {
                members.remove(&channel);
            }
        }
    }

    /// Live members of a group, dropping lapsed memberships.
    fn members(&self, group: &str) -> Vec<String> {
        let now = Instant::now();
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        self.forget_expired_receivers(&mut groups);
        let Some(members) = groups.get_mut(group) else {
            return Vec::new();
        };
        members.retain(|_, deadline| *deadline > now);
        let mut names: Vec<String> = members.keys().cloned().collect();
        names.sort();
        names
    }

    fn poll_once(&self, channels: &[&str]) -> Result<Option<(String, Message)>> {
        match self.channels.receive(channels) {
            Some((channel, body)) => Ok(Some((channel, self.codec.decode(&body)?))),
            None => Ok(None),
        }
    }
}

impl ChannelLayer for InMemoryLayer {
    fn send(&self, channel: &str, message: &Message) -> Result<()> {
        naming::validate_channel(channel)?;
        self.channels.send(channel, self.codec.encode(message)?)
    }

    fn receive(&self, channels: &[&str], block: bool) -> Result<Received> {
        for channel in channels {
            naming::validate_channel(channel)?;
        }
        let received = if block && !channels.is_empty() {
            poll_blocking(self.receive_timeout, || self.poll_once(channels))?
        } else {
            self.poll_once(channels)?
        };
        Ok(match received {
            Some((channel, message)) => (Some(channel), Some(message)),
            None => (None, None),
        })
    }

    fn new_channel(&self, pattern: &str) -> Result<String> {
        naming::validate_pattern(pattern)?;
        Ok(format!("{}{}", pattern, Uuid::new_v4().simple()))
    }

    fn declare_channel(&self, channel: &str) -> Result<()> {
        naming::validate_channel(channel)
    }

    fn group_add(&self, group: &str, channel: &str) -> Result<()> {
        naming::validate_group(group)?;
        naming::validate_channel(channel)?;
        let deadline = Instant::now() + self.membership_ttl;
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        self.forget_expired_receivers(&mut groups);
        groups
            .entry(group.to_string())
            .or_default()
            .insert(channel.to_string(), deadline);
        Ok(())
    }

    fn group_discard(&self, group: &str, channel: &str) -> Result<()> {
        naming::validate_group(group)?;
        if let Some(members) = self
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(group)
        {
            members.remove(channel);
        }
        Ok(())
    }

    /// Full members miss the message; the others still get it.
    fn send_group(&self, group: &str, message: &Message) -> Result<()> {
        naming::validate_group(group)?;
        let body = self.codec.encode(message)?;
        for member in self.members(group) {
            match self.channels.send(&member, body.clone()) {
                Ok(()) => {}
                Err(e) if e.is_channel_full() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.channels.clear();
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

// ============================================================================
// Harness selection
// ============================================================================

/// Backend a test suite runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessKind {
    /// A real RabbitMQ broker.
    Broker,
    /// [`InMemoryLayer`].
    InMemory,
}

/// Harnesses requested by a test suite. At most one kind may be active.
#[derive(Debug, Clone, Default)]
pub struct HarnessSet {
    kinds: Vec<HarnessKind>,
}

impl HarnessSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: HarnessKind) -> Self {
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
        self
    }

    /// The single selected harness.
    ///
    /// Fails with `ConfigurationConflict` when both kinds were requested.
    pub fn validate(&self) -> Result<HarnessKind> {
        match self.kinds.as_slice() {
            [kind] => Ok(*kind),
            [] => Err(LayerError::Config("no test harness selected".to_string())),
            _ => Err(LayerError::ConfigurationConflict(
                "broker and in-memory harnesses are mutually exclusive".to_string(),
            )),
        }
    }

    /// Validate, then build the layer for the selected harness.
    pub fn build(&self, config: LayerConfig) -> Result<Arc<dyn ChannelLayer>> {
        match self.validate()? {
            HarnessKind::Broker => layer_from_config(config),
            HarnessKind::InMemory => Ok(Arc::new(InMemoryLayer::with_config(&config)?)),
        }
    }
}
