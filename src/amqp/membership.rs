//! Group membership.
//!
//! Group messages flow `groups.<group>` -> `members.<queue>` -> member queue.
//! A membership is the exchange-to-exchange binding from the group exchange to
//! the member exchange, routed by the channel name. Its lifetime is tracked by
//! a marker message parked in a per-membership queue with a message TTL. When
//! the marker expires the broker dead-letters it to the control exchange and
//! the connection thread removes that one binding.
//!
//! Re-adding a member publishes a fresh marker. The marker queue holds one
//! message, so the previous marker is evicted and dead-lettered with reason
//! `maxlen`. Only a tagged marker whose death reason is `expired` ends a
//! membership.
//!
//! An ordinary message that expires unread means nobody is reading its
//! channel. Its member exchange is deleted, which drops the channel from every
//! group at once while leaving the queue in place.

use lapin::{
    message::Delivery as AmqpDelivery,
    options::{
        BasicAckOptions, ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
        ExchangeUnbindOptions, QueueBindOptions, QueueDeleteOptions,
    },
    protocol::AMQPSoftError,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, ExchangeKind,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::session::{is_soft, Session};
use crate::layer::{LayerError, Result};
use crate::naming;

/// Header carrying the event tag of layer-internal messages.
pub const EVENT_HEADER: &str = "x-layer-event";
/// Tag of membership markers.
pub const GROUP_EXPIRY_EVENT: &str = "group-expiry";
/// Header RabbitMQ adds to dead-lettered messages.
const X_DEATH: &str = "x-death";

/// Body of a membership marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipMarker {
    pub group: String,
    pub channel: String,
}

/// Why the broker dead-lettered a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeathReason {
    /// Per-message or per-queue TTL lapsed.
    Expired,
    /// Evicted by a newer message from a length-limited queue.
    MaxLen,
    Rejected,
    /// Missing or unrecognized reason.
    Other(String),
}

impl DeathReason {
    fn parse(reason: &str) -> Self {
        match reason {
            "expired" => DeathReason::Expired,
            "maxlen" => DeathReason::MaxLen,
            "rejected" => DeathReason::Rejected,
            other => DeathReason::Other(other.to_string()),
        }
    }
}

/// Classified dead-letter delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterEvent {
    /// A membership lapsed: remove the binding.
    MembershipExpired(MembershipMarker),
    /// A marker was replaced by a re-add: nothing to do.
    MarkerSuperseded(MembershipMarker),
    /// A channel message expired unread: its receiver is gone.
    MessageExpired { queue: String },
    /// An ordinary channel message died for another reason.
    MessageDied {
        queue: Option<String>,
        reason: DeathReason,
    },
    /// Tagged as a marker but unreadable.
    Malformed(String),
}

fn value_str(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

/// Most recent `x-death` entry as `(queue, reason)`.
fn last_death(headers: &FieldTable) -> (Option<String>, DeathReason) {
    let entry = match headers.inner().get(X_DEATH) {
        Some(AMQPValue::FieldArray(deaths)) => deaths.as_slice().first().and_then(|d| match d {
            AMQPValue::FieldTable(table) => Some(table.clone()),
            _ => None,
        }),
        _ => None,
    };
    let Some(entry) = entry else {
        return (None, DeathReason::Other("missing x-death".to_string()));
    };

    let field = |key: &str| entry.inner().get(key).and_then(value_str);
    let reason = field("reason")
        .map(|r| DeathReason::parse(&r))
        .unwrap_or_else(|| DeathReason::Other("missing reason".to_string()));
    (field("queue"), reason)
}

fn is_marker(headers: &FieldTable) -> bool {
    headers
        .inner()
        .get(EVENT_HEADER)
        .and_then(value_str)
        .is_some_and(|tag| tag == GROUP_EXPIRY_EVENT)
}

/// Classify a delivery from the dead-letter queue.
pub fn classify(properties: &BasicProperties, body: &[u8]) -> DeadLetterEvent {
    let empty = FieldTable::default();
    let headers = properties.headers().as_ref().unwrap_or(&empty);
    let (queue, reason) = last_death(headers);

    if !is_marker(headers) {
        return match (queue, reason) {
            (Some(queue), DeathReason::Expired) if !naming::is_marker_queue(&queue) => {
                DeadLetterEvent::MessageExpired { queue }
            }
            (queue, reason) => DeadLetterEvent::MessageDied { queue, reason },
        };
    }

    let marker: MembershipMarker = match serde_json::from_slice(body) {
        Ok(marker) => marker,
        Err(e) => return DeadLetterEvent::Malformed(e.to_string()),
    };
    match reason {
        DeathReason::Expired => DeadLetterEvent::MembershipExpired(marker),
        _ => DeadLetterEvent::MarkerSuperseded(marker),
    }
}

/// Headers of a membership marker.
pub fn marker_headers() -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(EVENT_HEADER),
        AMQPValue::LongString(LongString::from(GROUP_EXPIRY_EVENT)),
    );
    headers
}

impl Session {
    pub(super) async fn group_add(&mut self, group: &str, channel: &str) -> Result<()> {
        if self.ensure_channel(channel).await?.is_none() {
            warn!(group = %group, channel = %channel, "Cannot add vanished channel to group");
            return Ok(());
        }
        let exchange = self.ensure_group(group).await?;
        let member = self.ensure_member(channel).await?;

        if let Err(e) = self
            .work
            .exchange_bind(
                &member,
                &exchange,
                channel,
                ExchangeBindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            return Err(self.fail("Failed to bind member to group", e).await);
        }

        let marker_queue = naming::marker_queue(group, channel);
        let arguments = self.topology.marker_arguments();
        self.declare_queue(&marker_queue, arguments).await?;

        let body = serde_json::to_vec(&MembershipMarker {
            group: group.to_string(),
            channel: channel.to_string(),
        })
        .map_err(|e| LayerError::Serialization(e.to_string()))?;
        let properties = BasicProperties::default().with_headers(marker_headers());
        self.publish("", &marker_queue, &body, properties).await?;

        debug!(group = %group, channel = %channel, "Added channel to group");
        Ok(())
    }

    pub(super) async fn group_discard(&mut self, group: &str, channel: &str) -> Result<()> {
        self.unbind(group, channel).await?;

        let marker_queue = naming::marker_queue(group, channel);
        if let Err(e) = self
            .work
            .queue_delete(&marker_queue, QueueDeleteOptions::default())
            .await
        {
            if !is_soft(&e, AMQPSoftError::NOTFOUND) {
                return Err(self.fail("Failed to delete membership marker", e).await);
            }
            self.recover().await?;
        }
        self.topology.forget_queue(&marker_queue);
        Ok(())
    }

    /// Declare the member exchange of `channel` and bind the channel's queue
    /// to it. Returns the exchange name.
    ///
    /// The exchange is auto-delete, so it goes away with the queue.
    async fn ensure_member(&mut self, channel: &str) -> Result<String> {
        let member = naming::member_exchange(channel);
        let options = ExchangeDeclareOptions {
            auto_delete: true,
            ..Default::default()
        };
        if let Err(e) = self
            .work
            .exchange_declare(&member, ExchangeKind::Fanout, options, FieldTable::default())
            .await
        {
            return Err(self.fail("Failed to declare member exchange", e).await);
        }
        self.topology.record_exchange(&member);

        let queue = naming::queue_name(channel);
        if let Err(e) = self
            .work
            .queue_bind(
                &queue,
                &member,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            return Err(self.fail("Failed to bind channel to member exchange", e).await);
        }
        Ok(member)
    }

    /// Remove one membership. Missing exchanges count as removed.
    async fn unbind(&mut self, group: &str, channel: &str) -> Result<()> {
        let exchange = naming::group_exchange(group);
        let member = naming::member_exchange(channel);
        match self
            .work
            .exchange_unbind(
                &member,
                &exchange,
                channel,
                ExchangeUnbindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(()) => {
                debug!(group = %group, channel = %channel, "Removed channel from group");
                Ok(())
            }
            Err(e) if is_soft(&e, AMQPSoftError::NOTFOUND) => self.recover().await,
            Err(e) => Err(self.fail("Failed to unbind channel from group", e).await),
        }
    }

    /// Drop every membership of the channel backed by `queue`.
    async fn drop_memberships(&mut self, queue: &str) -> Result<()> {
        let member = naming::member_exchange_for_queue(queue);
        match self
            .work
            .exchange_delete(&member, ExchangeDeleteOptions::default())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_soft(&e, AMQPSoftError::NOTFOUND) => self.recover().await,
            Err(e) => Err(self.fail("Failed to delete member exchange", e).await),
        }
    }

    pub(super) async fn send_group(&mut self, group: &str, body: &[u8]) -> Result<()> {
        // Declaring first makes an empty group a silent no-op.
        let exchange = self.ensure_group(group).await?;
        let properties = BasicProperties::default()
            .with_expiration(super::topology::expiration(self.topology.message_ttl()));
        if !self.publish(&exchange, "", body, properties).await? {
            // Full members miss the message; the others still get it.
            debug!(group = %group, "Group message refused by a full member");
        }
        Ok(())
    }

    /// Act on one dead-lettered message and acknowledge it.
    pub(crate) async fn handle_dead_letter(&mut self, delivery: AmqpDelivery) {
        match classify(&delivery.properties, &delivery.data) {
            DeadLetterEvent::MembershipExpired(marker) => {
                match self.unbind(&marker.group, &marker.channel).await {
                    Ok(()) => info!(
                        group = %marker.group,
                        channel = %marker.channel,
                        "Group membership expired"
                    ),
                    Err(e) => warn!(
                        group = %marker.group,
                        channel = %marker.channel,
                        error = %e,
                        "Failed to expire group membership"
                    ),
                }
            }
            DeadLetterEvent::MarkerSuperseded(marker) => {
                debug!(group = %marker.group, channel = %marker.channel, "Membership refreshed");
            }
            DeadLetterEvent::MessageExpired { queue } => {
                match self.drop_memberships(&queue).await {
                    Ok(()) => info!(queue = %queue, "Message expired unread, left all groups"),
                    Err(e) => warn!(
                        queue = %queue,
                        error = %e,
                        "Failed to remove expired receiver from groups"
                    ),
                }
            }
            DeadLetterEvent::MessageDied { queue, reason } => {
                debug!(queue = ?queue, reason = ?reason, "Message dead-lettered");
            }
            DeadLetterEvent::Malformed(error) => {
                warn!(error = %error, "Unreadable membership marker");
            }
        }

        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            warn!(error = %e, "Failed to ack dead letter");
        }
    }
}
