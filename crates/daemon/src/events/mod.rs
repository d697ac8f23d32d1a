// Event Bus: per-partition fan-out with a bounded replay buffer.
//
// Publish and subscribe for a partition serialize on that partition's lock
// only, so a new subscriber sees each event exactly once: either in its
// replay or live. Delivery never blocks the publisher; a subscriber whose
// live backlog passes the limit is evicted and its queue closed.

mod subscription;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use mcpd_common::protocol::events::{BusEvent, EventPayload};
use mcpd_common::types::Partition;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use self::subscription::{BusMessage, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBusSettings {
    pub replay_capacity: usize,
    pub subscriber_backlog: usize,
    pub heartbeat_interval: Duration,
}

impl Default for EventBusSettings {
    fn default() -> Self {
        Self { replay_capacity: 1000, subscriber_backlog: 100, heartbeat_interval: Duration::from_secs(15) }
    }
}

#[derive(Debug)]
struct Envelope {
    event: Arc<BusEvent>,
    /// Live deliveries count against the backlog; replayed ones do not.
    live: bool,
}

struct SubscriberSlot {
    tx: mpsc::UnboundedSender<Envelope>,
    pending: Arc<AtomicUsize>,
    evicted: Arc<AtomicBool>,
}

#[derive(Default)]
struct ChannelState {
    replay: VecDeque<Arc<BusEvent>>,
    subscribers: HashMap<u64, SubscriberSlot>,
    published: u64,
    evictions: u64,
    /// Set when the channel is pruned; callers holding it look it up again.
    retired: bool,
}

struct PartitionChannel {
    state: Mutex<ChannelState>,
}

impl PartitionChannel {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, subscriber_id: u64) -> bool {
        self.lock().subscribers.remove(&subscriber_id).is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PartitionStats {
    pub partition: String,
    pub subscribers: usize,
    pub replay_len: usize,
    pub published: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BusStats {
    pub total_subscribers: usize,
    pub partitions: Vec<PartitionStats>,
}

pub struct EventBus {
    settings: EventBusSettings,
    channels: RwLock<HashMap<Partition, Arc<PartitionChannel>>>,
    next_event_id: AtomicU64,
    next_subscriber_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusSettings::default())
    }
}

impl EventBus {
    pub fn new(settings: EventBusSettings) -> Self {
        Self {
            settings,
            channels: RwLock::new(HashMap::new()),
            next_event_id: AtomicU64::new(1),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> EventBusSettings {
        self.settings
    }

    fn channel(&self, partition: &Partition) -> Arc<PartitionChannel> {
        if let Some(channel) = self.channels.read().unwrap_or_else(PoisonError::into_inner).get(partition) {
            return channel.clone();
        }
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(partition.clone())
            .or_insert_with(|| Arc::new(PartitionChannel { state: Mutex::new(ChannelState::default()) }))
            .clone()
    }

    /// Run `f` under the lock of the partition's live channel.
    fn with_channel<R>(
        &self,
        partition: &Partition,
        f: impl FnOnce(&Arc<PartitionChannel>, &mut ChannelState) -> R,
    ) -> R {
        loop {
            let channel = self.channel(partition);
            let mut state = channel.lock();
            if state.retired {
                continue;
            }
            return f(&channel, &mut *state);
        }
    }

    /// Append to the partition's replay buffer and fan out to its subscribers.
    pub fn publish(&self, partition: &Partition, payload: EventPayload) -> Arc<BusEvent> {
        self.with_channel(partition, |_, state| self.publish_locked(partition, state, payload))
    }

    fn publish_locked(&self, partition: &Partition, state: &mut ChannelState, payload: EventPayload) -> Arc<BusEvent> {
        // Ids are taken under the partition lock so they follow publish order.
        let event = Arc::new(BusEvent {
            id: self.next_event_id.fetch_add(1, Ordering::SeqCst),
            partition: partition.clone(),
            payload,
            emitted_at: Utc::now(),
        });

        if self.settings.replay_capacity > 0 {
            if state.replay.len() == self.settings.replay_capacity {
                state.replay.pop_front();
            }
            state.replay.push_back(event.clone());
        }
        state.published += 1;

        let backlog = self.settings.subscriber_backlog;
        let mut dropped = Vec::new();
        for (id, slot) in &state.subscribers {
            if slot.pending.load(Ordering::SeqCst) >= backlog {
                slot.evicted.store(true, Ordering::SeqCst);
                dropped.push(*id);
                continue;
            }
            slot.pending.fetch_add(1, Ordering::SeqCst);
            if slot.tx.send(Envelope { event: event.clone(), live: true }).is_err() {
                dropped.push(*id);
            }
        }
        for id in dropped {
            if let Some(slot) = state.subscribers.remove(&id) {
                if slot.evicted.load(Ordering::SeqCst) {
                    state.evictions += 1;
                    warn!(partition = %partition, subscriber = id, backlog, "evicted slow subscriber");
                } else {
                    debug!(partition = %partition, subscriber = id, "pruned closed subscriber");
                }
            }
        }

        event
    }

    pub fn subscribe(&self, partition: &Partition) -> Subscription {
        self.subscribe_after(partition, None)
    }

    /// Subscribe, replaying buffered events newer than `last_event_id`
    /// (everything buffered when `None`), then live events.
    pub fn subscribe_after(&self, partition: &Partition, last_event_id: Option<u64>) -> Subscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let evicted = Arc::new(AtomicBool::new(false));

        let channel = self.with_channel(partition, |channel, state| {
            let mut replayed = 0;
            for event in state.replay.iter().filter(|e| last_event_id.map_or(true, |last| e.id > last)) {
                let _ = tx.send(Envelope { event: event.clone(), live: false });
                replayed += 1;
            }
            state.subscribers.insert(id, SubscriberSlot { tx, pending: pending.clone(), evicted: evicted.clone() });
            debug!(partition = %partition, subscriber = id, replayed, "subscribed");
            channel.clone()
        });

        Subscription::new(
            id,
            partition.clone(),
            Arc::downgrade(&channel),
            rx,
            pending,
            evicted,
            self.settings.heartbeat_interval,
        )
    }

    pub fn subscriber_count(&self, partition: &Partition) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(partition)
            .map_or(0, |channel| channel.lock().subscribers.len())
    }

    /// Buffered events of a partition, oldest first.
    pub fn replay_snapshot(&self, partition: &Partition) -> Vec<Arc<BusEvent>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(partition)
            .map(|channel| channel.lock().replay.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop partitions with no subscribers whose newest event is older than
    /// `max_idle`, replay included. Returns how many were dropped.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let now = Utc::now();
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let before = channels.len();
        channels.retain(|partition, channel| {
            let mut state = channel.lock();
            let quiet = state.replay.back().map_or(true, |last| {
                now.signed_duration_since(last.emitted_at).to_std().is_ok_and(|age| age >= max_idle)
            });
            if state.subscribers.is_empty() && quiet {
                state.retired = true;
                debug!(partition = %partition, "pruned idle partition channel");
                return false;
            }
            true
        });
        before - channels.len()
    }

    pub fn stats(&self) -> BusStats {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        let mut partitions: Vec<PartitionStats> = channels
            .iter()
            .map(|(partition, channel)| {
                let state = channel.lock();
                PartitionStats {
                    partition: partition.to_string(),
                    subscribers: state.subscribers.len(),
                    replay_len: state.replay.len(),
                    published: state.published,
                    evictions: state.evictions,
                }
            })
            .collect();
        partitions.sort_by(|a, b| a.partition.cmp(&b.partition));
        BusStats { total_subscribers: partitions.iter().map(|p| p.subscribers).sum(), partitions }
    }
}
