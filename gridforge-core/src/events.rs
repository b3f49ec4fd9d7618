//! # Kernel Events — observable simulator occurrences
//!
//! Trips, faults, and connection decisions flow through one bounded log so
//! tests and telemetry can observe them without reaching into components.
//! Subscribers register a callback with an optional kind filter; delivery
//! is synchronous at publish time.

use crate::clock::SimClock;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Maximum records held before the oldest are pruned.
const MAX_EVENT_LOG: usize = 50_000;
const MAX_SUBSCRIBERS: usize = 128;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum KernelEvent {
    DeviceRegistered {
        device: String,
    },
    DeviceFaulted {
        device: String,
        consecutive_failures: u32,
    },
    ConnectionAllowed {
        peer: String,
        device: String,
        protocol: String,
        port: u16,
        src_network: String,
    },
    ConnectionDenied {
        peer: String,
        device: String,
        protocol: String,
        port: u16,
        reason: String,
    },
    GridTrip {
        frequency_hz: f64,
        limit_hz: f64,
        under_frequency: bool,
    },
    OverspeedTrip {
        device: String,
        speed_rpm: f64,
        trip_rpm: f64,
    },
    ReactorScram {
        device: String,
        core_temp_c: f64,
    },
    ContainmentBreach {
        device: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum EventKind {
    DeviceRegistered,
    DeviceFaulted,
    ConnectionAllowed,
    ConnectionDenied,
    GridTrip,
    OverspeedTrip,
    ReactorScram,
    ContainmentBreach,
}

impl KernelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            KernelEvent::DeviceRegistered { .. } => EventKind::DeviceRegistered,
            KernelEvent::DeviceFaulted { .. } => EventKind::DeviceFaulted,
            KernelEvent::ConnectionAllowed { .. } => EventKind::ConnectionAllowed,
            KernelEvent::ConnectionDenied { .. } => EventKind::ConnectionDenied,
            KernelEvent::GridTrip { .. } => EventKind::GridTrip,
            KernelEvent::OverspeedTrip { .. } => EventKind::OverspeedTrip,
            KernelEvent::ReactorScram { .. } => EventKind::ReactorScram,
            KernelEvent::ContainmentBreach { .. } => EventKind::ContainmentBreach,
        }
    }
}

/// A published event with its identity and both timebases.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct KernelRecord {
    pub id: u64,
    pub sim_time: f64,
    pub timestamp_ms: i64,
    pub event: KernelEvent,
}

pub type SubscriberFn = Arc<dyn Fn(&KernelRecord) + Send + Sync>;

struct Subscription {
    id: u64,
    name: String,
    filter: Option<EventKind>,
    callback: SubscriberFn,
}

pub struct EventLog {
    clock: Arc<SimClock>,
    log: RwLock<Vec<KernelRecord>>,
    subscriptions: RwLock<Vec<Subscription>>,
    counts: RwLock<BTreeMap<EventKind, u64>>,
    next_event_id: AtomicU64,
    next_sub_id: AtomicU64,
    total_published: AtomicU64,
    total_delivered: AtomicU64,
}

impl EventLog {
    pub fn new(clock: Arc<SimClock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            log: RwLock::new(Vec::with_capacity(1024)),
            subscriptions: RwLock::new(Vec::new()),
            counts: RwLock::new(BTreeMap::new()),
            next_event_id: AtomicU64::new(1),
            next_sub_id: AtomicU64::new(1),
            total_published: AtomicU64::new(0),
            total_delivered: AtomicU64::new(0),
        })
    }

    /// Publish an event. Returns the assigned record id.
    pub fn publish(&self, event: KernelEvent) -> u64 {
        let id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        let record = KernelRecord {
            id,
            sim_time: self.clock.now(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            event,
        };
        self.total_published.fetch_add(1, Ordering::Relaxed);
        *self.counts.write().entry(record.event.kind()).or_insert(0) += 1;

        debug!(id, kind = ?record.event.kind(), sim_time = record.sim_time, "Kernel event");

        let subs = self.subscriptions.read();
        for sub in subs.iter() {
            if sub.filter.map_or(true, |k| k == record.event.kind()) {
                (sub.callback)(&record);
                self.total_delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(subs);

        let mut log = self.log.write();
        if log.len() >= MAX_EVENT_LOG {
            let drain = MAX_EVENT_LOG / 10;
            log.drain(..drain);
        }
        log.push(record);
        id
    }

    /// Subscribe to events, optionally filtered by kind. Returns the
    /// subscription id for unsubscribe.
    pub fn subscribe(
        &self,
        name: &str,
        filter: Option<EventKind>,
        callback: SubscriberFn,
    ) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subscriptions.write();
        if subs.len() >= MAX_SUBSCRIBERS {
            warn!(name, "Max subscribers reached, dropping oldest");
            subs.remove(0);
        }
        subs.push(Subscription {
            id,
            name: name.into(),
            filter,
            callback,
        });
        id
    }

    pub fn unsubscribe(&self, sub_id: u64) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| {
            if s.id == sub_id {
                debug!(name = %s.name, "Subscription removed");
                false
            } else {
                true
            }
        });
        subs.len() < before
    }

    /// Most recent records, newest first, optionally filtered by kind.
    pub fn recent(&self, limit: usize, kind: Option<EventKind>) -> Vec<KernelRecord> {
        let log = self.log.read();
        log.iter()
            .rev()
            .filter(|r| kind.map_or(true, |k| r.event.kind() == k))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> u64 {
        self.counts.read().get(&kind).copied().unwrap_or(0)
    }

    pub fn total_published(&self) -> u64 {
        self.total_published.load(Ordering::Relaxed)
    }

    pub fn total_delivered(&self) -> u64 {
        self.total_delivered.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.read().is_empty()
    }
}
