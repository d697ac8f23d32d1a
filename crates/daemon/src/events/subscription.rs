// Subscriber side of the Event Bus.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mcpd_common::protocol::events::BusEvent;
use mcpd_common::types::Partition;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::debug;

use super::{Envelope, PartitionChannel};

/// What a subscriber receives: a published event or a keep-alive.
#[derive(Debug, Clone)]
pub enum BusMessage {
    Event(Arc<BusEvent>),
    /// Never buffered for replay.
    Heartbeat { at: DateTime<Utc> },
}

pub struct Subscription {
    id: u64,
    partition: Partition,
    channel: Weak<PartitionChannel>,
    rx: Option<mpsc::UnboundedReceiver<Envelope>>,
    pending: Arc<AtomicUsize>,
    evicted: Arc<AtomicBool>,
    heartbeat_period: Duration,
    /// Started on the first `recv`, so subscribing needs no runtime.
    heartbeat: Option<Interval>,
}

impl Subscription {
    pub(super) fn new(
        id: u64,
        partition: Partition,
        channel: Weak<PartitionChannel>,
        rx: mpsc::UnboundedReceiver<Envelope>,
        pending: Arc<AtomicUsize>,
        evicted: Arc<AtomicBool>,
        heartbeat_interval: Duration,
    ) -> Self {
        let heartbeat_period = heartbeat_interval.max(Duration::from_millis(1));
        Self { id, partition, channel, rx: Some(rx), pending, evicted, heartbeat_period, heartbeat: None }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Set once the bus dropped this subscriber for falling behind.
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    /// Next event or heartbeat; `None` once unsubscribed or evicted.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        if self.is_evicted() {
            self.rx = None;
            return None;
        }
        let rx = self.rx.as_mut()?;
        let period = self.heartbeat_period;
        let heartbeat = self.heartbeat.get_or_insert_with(|| {
            let mut heartbeat = interval_at(Instant::now() + period, period);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            heartbeat
        });
        tokio::select! {
            biased;
            _ = heartbeat.tick() => Some(BusMessage::Heartbeat { at: Utc::now() }),
            envelope = rx.recv() => match envelope {
                Some(envelope) => {
                    if envelope.live {
                        self.pending.fetch_sub(1, Ordering::SeqCst);
                    }
                    Some(BusMessage::Event(envelope.event))
                }
                None => {
                    self.rx = None;
                    None
                }
            },
        }
    }

    /// Stop delivery and release the queue. Safe to call repeatedly.
    pub fn unsubscribe(&mut self) {
        if self.rx.take().is_none() {
            return;
        }
        if let Some(channel) = self.channel.upgrade() {
            if channel.remove(self.id) {
                debug!(partition = %self.partition, subscriber = self.id, "unsubscribed");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
