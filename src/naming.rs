//! Topology naming.
//!
//! Maps logical channel and group names onto broker object names.
//!
//! ## Channel name shapes
//!
//! | Shape                      | Example              | Queue                 |
//! |----------------------------|----------------------|-----------------------|
//! | plain                      | `http.request`       | `http.request`        |
//! | single-reader generated    | `http.response!Ab12` | `amq.gen-Ab12`        |
//! | process-local generated    | `daphne.response?Ab12` | `amq.gen-Ab12`      |
//!
//! Generated names carry the broker's auto-generated queue name with its
//! `amq.gen-` prefix stripped, so the queue can be recovered from the channel
//! name alone.

use crate::layer::{LayerError, Result};

/// Prefix RabbitMQ puts on server-named queues.
pub const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";

/// Control exchange and queue receiving every dead-lettered message.
pub const DEAD_LETTERS: &str = "dead-letters";

/// Prefix of the per-membership marker queues.
pub const MARKER_QUEUE_PREFIX: &str = "expire.bind.";

/// Prefix of group fanout exchanges.
pub const GROUP_EXCHANGE_PREFIX: &str = "groups.";

/// Prefix of the per-member fanout exchanges sitting between a group and a
/// member queue.
pub const MEMBER_EXCHANGE_PREFIX: &str = "members.";

/// Marker separating a generated channel's prefix from its random suffix.
pub const SINGLE_READER_MARKER: char = '!';
pub const PROCESS_LOCAL_MARKER: char = '?';

/// Longest accepted channel or group name.
pub const MAX_NAME_LENGTH: usize = 100;

/// Semantic class of a channel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Ordinary name, e.g. `http.request`.
    Plain,
    /// Contains `!`: exactly one reader, possibly in another process.
    SingleReader,
    /// Contains `?`: read only by the process that created it.
    ProcessLocal,
}

impl ChannelKind {
    pub fn of(channel: &str) -> Self {
        if channel.contains(SINGLE_READER_MARKER) {
            ChannelKind::SingleReader
        } else if channel.contains(PROCESS_LOCAL_MARKER) {
            ChannelKind::ProcessLocal
        } else {
            ChannelKind::Plain
        }
    }

    pub fn is_generated(self) -> bool {
        !matches!(self, ChannelKind::Plain)
    }
}

/// Split a generated channel name into `(prefix_with_marker, suffix)`.
fn split_generated(channel: &str) -> Option<(&str, &str)> {
    let idx = channel.rfind([SINGLE_READER_MARKER, PROCESS_LOCAL_MARKER])?;
    Some((&channel[..=idx], &channel[idx + 1..]))
}

/// Queue backing a channel.
pub fn queue_name(channel: &str) -> String {
    match split_generated(channel) {
        Some((_, suffix)) => format!("{}{}", GENERATED_QUEUE_PREFIX, suffix),
        None => channel.to_string(),
    }
}

/// Whether a queue was named by the broker and so cannot be declared by us.
pub fn is_generated_queue(queue: &str) -> bool {
    queue.starts_with(GENERATED_QUEUE_PREFIX)
}

/// Channel name for a broker-named queue created from `pattern`.
///
/// Returns `None` when the queue does not carry the broker prefix.
pub fn generated_channel_name(pattern: &str, queue: &str) -> Option<String> {
    queue
        .strip_prefix(GENERATED_QUEUE_PREFIX)
        .map(|suffix| format!("{}{}", pattern, suffix))
}

/// Fanout exchange of a group.
pub fn group_exchange(group: &str) -> String {
    format!("{}{}", GROUP_EXCHANGE_PREFIX, group)
}

/// Exchange that every group membership of `channel` is bound through.
pub fn member_exchange(channel: &str) -> String {
    member_exchange_for_queue(&queue_name(channel))
}

/// Member exchange of the channel backed by `queue`.
///
/// Dead letters only name the queue a message died in, so cleanup works from
/// the queue name.
pub fn member_exchange_for_queue(queue: &str) -> String {
    format!("{}{}", MEMBER_EXCHANGE_PREFIX, queue)
}

/// Marker queue whose single message tracks one (group, channel) membership.
pub fn marker_queue(group: &str, channel: &str) -> String {
    format!("{}{}.{}", MARKER_QUEUE_PREFIX, group, queue_name(channel))
}

pub fn is_marker_queue(queue: &str) -> bool {
    queue.starts_with(MARKER_QUEUE_PREFIX)
}

fn check_length(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LayerError::InvalidName(format!("{} name is empty", kind)));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(LayerError::InvalidName(format!(
            "{} name '{}' is longer than {} characters",
            kind, name, MAX_NAME_LENGTH
        )));
    }
    Ok(())
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Validate a channel name: name characters plus at most one `!`/`?` marker.
pub fn validate_channel(channel: &str) -> Result<()> {
    check_length("Channel", channel)?;
    let markers = channel
        .chars()
        .filter(|c| *c == SINGLE_READER_MARKER || *c == PROCESS_LOCAL_MARKER)
        .count();
    if markers > 1 {
        return Err(LayerError::InvalidName(format!(
            "Channel name '{}' has more than one '!' or '?'",
            channel
        )));
    }
    if let Some(bad) = channel
        .chars()
        .find(|c| !is_name_char(*c) && *c != SINGLE_READER_MARKER && *c != PROCESS_LOCAL_MARKER)
    {
        return Err(LayerError::InvalidName(format!(
            "Channel name '{}' contains '{}'",
            channel, bad
        )));
    }
    Ok(())
}

/// Validate a `new_channel` pattern: a channel name ending in its marker.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    validate_channel(pattern)?;
    if !pattern.ends_with([SINGLE_READER_MARKER, PROCESS_LOCAL_MARKER]) {
        return Err(LayerError::InvalidName(format!(
            "Pattern '{}' must end with '!' or '?'",
            pattern
        )));
    }
    Ok(())
}

/// Validate a group name: name characters only.
pub fn validate_group(group: &str) -> Result<()> {
    check_length("Group", group)?;
    if let Some(bad) = group.chars().find(|c| !is_name_char(*c)) {
        return Err(LayerError::InvalidName(format!(
            "Group name '{}' contains '{}'",
            group, bad
        )));
    }
    Ok(())
}
