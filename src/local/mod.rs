//! In-process channel store.
//!
//! Backs the hybrid layer's process-local channels with the same observable
//! rules as the broker path: per-channel capacity, per-message expiry and FIFO
//! order. All state sits behind one mutex. A reaper thread drops expired
//! messages so idle channels do not hold memory.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::CapacityRules;
use crate::layer::{LayerError, Result};

/// Lower bound of the reaper interval.
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(100);
/// Upper bound of the reaper interval.
const MAX_REAP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Entry {
    deadline: Instant,
    body: Vec<u8>,
}

#[derive(Debug, Default)]
struct LocalState {
    channels: HashMap<String, VecDeque<Entry>>,
    /// Local channel -> groups it joined on the broker.
    bridged: HashMap<String, HashSet<String>>,
    /// Channels that lost a message to expiry since the last `take_expired`.
    expired: HashSet<String>,
}

fn drop_expired(queue: &mut VecDeque<Entry>, now: Instant) -> usize {
    let before = queue.len();
    while queue.front().is_some_and(|e| e.deadline <= now) {
        queue.pop_front();
    }
    before - queue.len()
}

/// Capacity- and TTL-bounded channels held in process memory.
#[derive(Debug)]
pub struct LocalChannels {
    state: Mutex<LocalState>,
    rules: CapacityRules,
    ttl: Duration,
    track_expired: bool,
}

impl LocalChannels {
    pub fn new(rules: CapacityRules, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            rules,
            ttl,
            track_expired: false,
        }
    }

    /// Also record which channels had messages expire, for [`take_expired`].
    ///
    /// [`take_expired`]: LocalChannels::take_expired
    pub fn tracking_expired(mut self) -> Self {
        self.track_expired = true;
        self
    }

    fn expire(
        &self,
        expired: &mut HashSet<String>,
        channel: &str,
        queue: &mut VecDeque<Entry>,
        now: Instant,
    ) -> usize {
        let dropped = drop_expired(queue, now);
        if dropped > 0 && self.track_expired {
            expired.insert(channel.to_string());
        }
        dropped
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a payload, failing with `ChannelFull` at capacity.
    pub fn send(&self, channel: &str, body: Vec<u8>) -> Result<()> {
        let capacity = self.rules.capacity_for(channel);
        let now = Instant::now();
        let mut state = self.lock();
        let LocalState {
            channels, expired, ..
        } = &mut *state;
        let queue = channels.entry(channel.to_string()).or_default();
        self.expire(expired, channel, queue, now);

        if queue.len() >= capacity {
            debug!(channel = %channel, capacity, "Local channel full");
            return Err(LayerError::ChannelFull {
                channel: channel.to_string(),
            });
        }

        queue.push_back(Entry {
            deadline: now + self.ttl,
            body,
        });
        trace!(channel = %channel, depth = queue.len(), "Queued local message");
        Ok(())
    }

    /// Pop the oldest live payload of the first channel that has one.
    pub fn receive(&self, channels: &[&str]) -> Option<(String, Vec<u8>)> {
        let now = Instant::now();
        let mut state = self.lock();
        let LocalState {
            channels: queues,
            expired,
            ..
        } = &mut *state;
        for channel in channels {
            let Some(queue) = queues.get_mut(*channel) else {
                continue;
            };
            self.expire(expired, channel, queue, now);
            let entry = queue.pop_front();
            if queue.is_empty() {
                queues.remove(*channel);
            }
            if let Some(entry) = entry {
                return Some((channel.to_string(), entry.body));
            }
        }
        None
    }

    /// Number of live messages in a channel.
    pub fn depth(&self, channel: &str) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let LocalState {
            channels, expired, ..
        } = &mut *state;
        channels
            .get_mut(channel)
            .map(|queue| {
                self.expire(expired, channel, queue, now);
                queue.len()
            })
            .unwrap_or(0)
    }

    /// Drop expired messages and empty channels. Returns messages dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let LocalState {
            channels, expired, ..
        } = &mut *state;
        let mut dropped = 0;
        channels.retain(|channel, queue| {
            dropped += self.expire(expired, channel, queue, now);
            !queue.is_empty()
        });
        dropped
    }

    /// Channels that had a message expire unread since the last call.
    pub fn take_expired(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().expired.drain().collect();
        names.sort();
        names
    }

    /// Remember that a local channel joined `group` on the broker.
    pub fn mark_bridged(&self, channel: &str, group: &str) {
        self.lock()
            .bridged
            .entry(channel.to_string())
            .or_default()
            .insert(group.to_string());
    }

    /// Forget one group of a bridged channel. The channel stops being bridged
    /// once it has left every group.
    pub fn unmark_bridged(&self, channel: &str, group: &str) {
        let mut state = self.lock();
        if let Some(groups) = state.bridged.get_mut(channel) {
            groups.remove(group);
            if groups.is_empty() {
                state.bridged.remove(channel);
            }
        }
    }

    pub fn is_bridged(&self, channel: &str) -> bool {
        self.lock().bridged.contains_key(channel)
    }

    /// Drop every message and bridge record.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.channels.clear();
        state.bridged.clear();
        state.expired.clear();
    }

    /// Start the background reaper. It stops once the store is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let interval = (self.ttl / 2).clamp(MIN_REAP_INTERVAL, MAX_REAP_INTERVAL);
        let store: Weak<Self> = Arc::downgrade(self);
        std::thread::Builder::new()
            .name("channel-layer-reaper".to_string())
            .spawn(move || loop {
                std::thread::sleep(interval);
                let Some(store) = store.upgrade() else {
                    break;
                };
                let dropped = store.purge_expired();
                if dropped > 0 {
                    debug!(dropped, "Reaped expired local messages");
                }
            })
    }
}
