//! Queue and exchange arguments, and the record of what this layer declared.
//!
//! | Object                     | Arguments                                        |
//! |----------------------------|--------------------------------------------------|
//! | channel queue              | max-length, reject-publish, expires, DLX         |
//! | marker queue               | message-ttl, max-length 1, expires, DLX          |
//! | `dead-letters` exchange    | fanout, bound to the `dead-letters` queue        |
//! | `groups.<group>` exchange  | fanout, auto-delete                              |

use std::collections::BTreeSet;
use std::time::Duration;

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};

use crate::config::{CapacityRules, MARKER_QUEUE_GRACE_MS};
use crate::naming::DEAD_LETTERS;

/// Broker argument keys.
pub(crate) mod args {
    pub const MAX_LENGTH: &str = "x-max-length";
    pub const OVERFLOW: &str = "x-overflow";
    pub const EXPIRES: &str = "x-expires";
    pub const MESSAGE_TTL: &str = "x-message-ttl";
    pub const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
    pub const REJECT_PUBLISH: &str = "reject-publish";
    pub const DROP_HEAD: &str = "drop-head";
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn insert_long(table: &mut FieldTable, key: &str, value: i64) {
    table.insert(ShortString::from(key), AMQPValue::LongLongInt(value));
}

fn insert_str(table: &mut FieldTable, key: &str, value: &str) {
    table.insert(ShortString::from(key), AMQPValue::LongString(LongString::from(value)));
}

/// Per-message expiration property, in milliseconds.
pub(crate) fn expiration(ttl: Duration) -> ShortString {
    ShortString::from(millis(ttl).to_string())
}

/// Argument builder and declaration record.
#[derive(Debug)]
pub(crate) struct Topology {
    rules: CapacityRules,
    message_ttl: Duration,
    membership_ttl: Duration,
    channel_ttl: Duration,
    queues: BTreeSet<String>,
    exchanges: BTreeSet<String>,
}

impl Topology {
    pub(crate) fn new(
        rules: CapacityRules,
        message_ttl: Duration,
        membership_ttl: Duration,
        channel_ttl: Duration,
    ) -> Self {
        Self {
            rules,
            message_ttl,
            membership_ttl,
            channel_ttl,
            queues: BTreeSet::new(),
            exchanges: BTreeSet::new(),
        }
    }

    /// Capacity of a channel, or of the channels a pattern generates.
    pub(crate) fn capacity(&self, channel: &str) -> usize {
        self.rules.capacity_for(channel)
    }

    pub(crate) fn message_ttl(&self) -> Duration {
        self.message_ttl
    }

    /// Arguments of the queue backing `channel`.
    pub(crate) fn channel_arguments(&self, channel: &str) -> FieldTable {
        let capacity = i64::try_from(self.capacity(channel)).unwrap_or(i64::MAX);
        let mut table = FieldTable::default();
        insert_long(&mut table, args::MAX_LENGTH, capacity);
        insert_str(&mut table, args::OVERFLOW, args::REJECT_PUBLISH);
        insert_long(&mut table, args::EXPIRES, millis(self.channel_ttl));
        insert_str(&mut table, args::DEAD_LETTER_EXCHANGE, DEAD_LETTERS);
        table
    }

    /// Arguments of a membership marker queue.
    ///
    /// The queue holds at most one marker. It outlives the marker's TTL by a
    /// short grace period so the expiry is dead-lettered before the queue goes.
    pub(crate) fn marker_arguments(&self) -> FieldTable {
        let ttl = millis(self.membership_ttl);
        let mut table = FieldTable::default();
        insert_long(&mut table, args::MESSAGE_TTL, ttl);
        insert_long(&mut table, args::MAX_LENGTH, 1);
        insert_str(&mut table, args::OVERFLOW, args::DROP_HEAD);
        insert_long(
            &mut table,
            args::EXPIRES,
            ttl.saturating_add(MARKER_QUEUE_GRACE_MS as i64),
        );
        insert_str(&mut table, args::DEAD_LETTER_EXCHANGE, DEAD_LETTERS);
        table
    }

    pub(crate) fn record_queue(&mut self, queue: &str) {
        self.queues.insert(queue.to_string());
    }

    pub(crate) fn forget_queue(&mut self, queue: &str) {
        self.queues.remove(queue);
    }

    pub(crate) fn knows_queue(&self, queue: &str) -> bool {
        self.queues.contains(queue)
    }

    pub(crate) fn record_exchange(&mut self, exchange: &str) {
        self.exchanges.insert(exchange.to_string());
    }

    /// Hand over everything declared so far and start a fresh record.
    pub(crate) fn take_declared(&mut self) -> (Vec<String>, Vec<String>) {
        let queues = std::mem::take(&mut self.queues).into_iter().collect();
        let exchanges = std::mem::take(&mut self.exchanges).into_iter().collect();
        (queues, exchanges)
    }
}
