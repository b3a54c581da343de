//! Lock-manager observability: events, observers and aggregated metrics.
//!
//! Observation is opt-in via the [`LockObserver`] trait. The lock manager
//! calls observers while holding a queue mutex, so implementations must be
//! cheap and must never call back into the lock manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use lockwise_error::AbortReason;
use lockwise_types::{LockMode, ResourceId, TxnId};
use parking_lot::Mutex;
use serde::Serialize;

// ---------------------------------------------------------------------------
// LockEvent
// ---------------------------------------------------------------------------

/// A single event emitted by the lock manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LockEvent {
    /// A request was granted (possibly after waiting).
    Granted {
        resource: ResourceId,
        txn: TxnId,
        mode: LockMode,
        /// True when the request replaced a weaker lock on the same resource.
        upgrade: bool,
        /// Nanoseconds the caller spent blocked (0 for immediate grants).
        waited_ns: u64,
    },
    /// A request could not be granted immediately and the caller blocked.
    Waiting {
        resource: ResourceId,
        txn: TxnId,
        mode: LockMode,
    },
    /// A granted lock was released, by unlock or by commit/abort.
    Released {
        resource: ResourceId,
        txn: TxnId,
        mode: LockMode,
    },
    /// The lock manager aborted a transaction.
    Aborted { txn: TxnId, reason: AbortReason },
    /// The deadlock detector picked `txn` to break a waits-for cycle.
    DeadlockVictim { txn: TxnId, cycle_len: usize },
}

impl LockEvent {
    /// The transaction the event is about.
    #[must_use]
    pub fn txn(&self) -> TxnId {
        match self {
            Self::Granted { txn, .. }
            | Self::Waiting { txn, .. }
            | Self::Released { txn, .. }
            | Self::Aborted { txn, .. }
            | Self::DeadlockVictim { txn, .. } => *txn,
        }
    }

    /// The resource involved, for events tied to one.
    #[must_use]
    pub fn resource(&self) -> Option<ResourceId> {
        match self {
            Self::Granted { resource, .. }
            | Self::Waiting { resource, .. }
            | Self::Released { resource, .. } => Some(*resource),
            Self::Aborted { .. } | Self::DeadlockVictim { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// LockObserver
// ---------------------------------------------------------------------------

/// Observer trait for lock events.
///
/// Called on the hot path under the resource's queue mutex.
pub trait LockObserver: Send + Sync {
    fn on_event(&self, event: &LockEvent);
}

/// Observer that does nothing. Default when observability is not configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl LockObserver for NoOpObserver {
    #[inline(always)]
    fn on_event(&self, _event: &LockEvent) {}
}

// ---------------------------------------------------------------------------
// LockEventLog: bounded ring buffer
// ---------------------------------------------------------------------------

/// Fixed-capacity log of recent lock events; the oldest event is overwritten
/// once full.
pub struct LockEventLog {
    events: Mutex<RingBuf>,
}

struct RingBuf {
    buf: Vec<LockEvent>,
    capacity: usize,
    head: usize,
    len: usize,
}

impl RingBuf {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, event: LockEvent) {
        if self.capacity == 0 {
            return;
        }
        let idx = (self.head + self.len) % self.capacity;
        if self.buf.len() < self.capacity {
            self.buf.push(event);
        } else {
            self.buf[idx] = event;
        }
        if self.len == self.capacity {
            self.head = (self.head + 1) % self.capacity;
        } else {
            self.len += 1;
        }
    }

    fn ordered(&self) -> Vec<LockEvent> {
        (0..self.len)
            .map(|i| self.buf[(self.head + i) % self.capacity].clone())
            .collect()
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.head = 0;
        self.len = 0;
    }
}

impl LockEventLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(RingBuf::new(capacity)),
        }
    }

    pub fn push(&self, event: LockEvent) {
        self.events.lock().push(event);
    }

    /// All stored events, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LockEvent> {
        self.events.lock().ordered()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.events.lock().capacity
    }
}

// ---------------------------------------------------------------------------
// LockMetrics: aggregated counters
// ---------------------------------------------------------------------------

/// Aggregated lock statistics. Counters are atomic; the per-reason and
/// per-resource maps sit behind a mutex.
pub struct LockMetrics {
    pub grants: AtomicU64,
    pub upgrades: AtomicU64,
    pub waits: AtomicU64,
    pub releases: AtomicU64,
    pub aborts: AtomicU64,
    pub deadlock_victims: AtomicU64,
    /// Sum of blocked time across all granted requests.
    pub total_wait_ns: AtomicU64,
    abort_reasons: Mutex<HashMap<AbortReason, u64>>,
    contention: Mutex<HashMap<ResourceId, u64>>,
    created_at: Instant,
}

impl LockMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            grants: AtomicU64::new(0),
            upgrades: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            deadlock_victims: AtomicU64::new(0),
            total_wait_ns: AtomicU64::new(0),
            abort_reasons: Mutex::new(HashMap::new()),
            contention: Mutex::new(HashMap::new()),
            created_at: Instant::now(),
        }
    }

    /// Fold one event into the counters.
    pub fn record(&self, event: &LockEvent) {
        match event {
            LockEvent::Granted {
                upgrade, waited_ns, ..
            } => {
                self.grants.fetch_add(1, Ordering::Relaxed);
                if *upgrade {
                    self.upgrades.fetch_add(1, Ordering::Relaxed);
                }
                self.total_wait_ns.fetch_add(*waited_ns, Ordering::Relaxed);
            }
            LockEvent::Waiting { resource, .. } => {
                self.waits.fetch_add(1, Ordering::Relaxed);
                *self.contention.lock().entry(*resource).or_insert(0) += 1;
            }
            LockEvent::Released { .. } => {
                self.releases.fetch_add(1, Ordering::Relaxed);
            }
            LockEvent::Aborted { reason, .. } => {
                self.aborts.fetch_add(1, Ordering::Relaxed);
                *self.abort_reasons.lock().entry(*reason).or_insert(0) += 1;
            }
            LockEvent::DeadlockVictim { .. } => {
                self.deadlock_victims.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn reset(&self) {
        self.grants.store(0, Ordering::Relaxed);
        self.upgrades.store(0, Ordering::Relaxed);
        self.waits.store(0, Ordering::Relaxed);
        self.releases.store(0, Ordering::Relaxed);
        self.aborts.store(0, Ordering::Relaxed);
        self.deadlock_victims.store(0, Ordering::Relaxed);
        self.total_wait_ns.store(0, Ordering::Relaxed);
        self.abort_reasons.lock().clear();
        self.contention.lock().clear();
    }

    /// Number of aborts recorded for `reason`.
    #[must_use]
    pub fn aborts_for(&self, reason: AbortReason) -> u64 {
        self.abort_reasons.lock().get(&reason).copied().unwrap_or(0)
    }

    /// Top `n` resources by number of blocked requests.
    #[must_use]
    pub fn top_contended(&self, n: usize) -> Vec<(ResourceId, u64)> {
        let mut entries: Vec<(ResourceId, u64)> = {
            let map = self.contention.lock();
            map.iter().map(|(&k, &v)| (k, v)).collect()
        };
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries.truncate(n);
        entries
    }

    #[must_use]
    pub fn snapshot(&self) -> LockMetricsSnapshot {
        let mut abort_reasons: Vec<(AbortReason, u64)> = self
            .abort_reasons
            .lock()
            .iter()
            .map(|(&k, &v)| (k, v))
            .collect();
        abort_reasons.sort_by_key(|(reason, _)| reason.as_str());
        LockMetricsSnapshot {
            grants: self.grants.load(Ordering::Relaxed),
            upgrades: self.upgrades.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            deadlock_victims: self.deadlock_victims.load(Ordering::Relaxed),
            total_wait_ns: self.total_wait_ns.load(Ordering::Relaxed),
            abort_reasons,
            top_contended: self.top_contended(10),
            elapsed_secs: self.created_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for LockMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of [`LockMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct LockMetricsSnapshot {
    pub grants: u64,
    pub upgrades: u64,
    pub waits: u64,
    pub releases: u64,
    pub aborts: u64,
    pub deadlock_victims: u64,
    pub total_wait_ns: u64,
    pub abort_reasons: Vec<(AbortReason, u64)>,
    pub top_contended: Vec<(ResourceId, u64)>,
    pub elapsed_secs: f64,
}

// ---------------------------------------------------------------------------
// MetricsObserver
// ---------------------------------------------------------------------------

/// Observer recording every event into [`LockMetrics`] and a [`LockEventLog`].
pub struct MetricsObserver {
    metrics: LockMetrics,
    log: LockEventLog,
}

impl MetricsObserver {
    #[must_use]
    pub fn new(log_capacity: usize) -> Self {
        Self {
            metrics: LockMetrics::new(),
            log: LockEventLog::new(log_capacity),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &LockMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn log(&self) -> &LockEventLog {
        &self.log
    }

    pub fn reset(&self) {
        self.metrics.reset();
        self.log.clear();
    }
}

impl LockObserver for MetricsObserver {
    fn on_event(&self, event: &LockEvent) {
        self.metrics.record(event);
        self.log.push(event.clone());
    }
}
