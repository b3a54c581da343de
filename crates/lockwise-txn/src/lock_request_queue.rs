//! Per-resource FIFO request queue.
//!
//! Granted requests always form a prefix of the queue. A grant pass walks the
//! ungranted suffix in order and stops at the first request that conflicts
//! with anything already granted, so a compatible newcomer never overtakes an
//! earlier waiter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use lockwise_types::{LockMode, ResourceId, TxnId};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use smallvec::SmallVec;

use crate::transaction::Transaction;

/// Inline capacity for granted-mode lists; most resources have few holders.
pub type GrantedModes = SmallVec<[(TxnId, LockMode); 4]>;

/// One transaction's claim on a resource.
#[derive(Debug, Clone)]
pub(crate) struct LockRequest {
    pub txn: Arc<Transaction>,
    pub txn_id: TxnId,
    pub mode: LockMode,
    pub granted: bool,
    pub upgrade: bool,
    pub enqueued_at: Instant,
}

impl LockRequest {
    pub fn new(txn: &Arc<Transaction>, mode: LockMode, upgrade: bool) -> Self {
        Self {
            txn: Arc::clone(txn),
            txn_id: txn.id(),
            mode,
            granted: false,
            upgrade,
            enqueued_at: Instant::now(),
        }
    }
}

/// Read-only view of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockRequestSnapshot {
    pub txn_id: TxnId,
    pub mode: LockMode,
    pub granted: bool,
    pub upgrade: bool,
}

/// Queue contents, guarded by [`LockRequestQueue::state`].
#[derive(Debug, Default)]
pub(crate) struct QueueState {
    pub requests: VecDeque<LockRequest>,
    /// Transaction with an upgrade in flight on this resource.
    pub upgrading: Option<TxnId>,
}

impl QueueState {
    pub fn get(&self, txn_id: TxnId) -> Option<&LockRequest> {
        self.requests.iter().find(|req| req.txn_id == txn_id)
    }

    /// Append a fresh request at the tail.
    pub fn push_back(&mut self, request: LockRequest) {
        self.requests.push_back(request);
    }

    /// Place an upgrade request ahead of every ordinary waiter.
    pub fn insert_upgrade(&mut self, request: LockRequest) {
        let at = self
            .requests
            .iter()
            .position(|req| !req.granted)
            .unwrap_or(self.requests.len());
        self.requests.insert(at, request);
    }

    /// Remove `txn_id`'s request, clearing its upgrade marker.
    pub fn remove(&mut self, txn_id: TxnId) -> Option<LockRequest> {
        if self.upgrading == Some(txn_id) {
            self.upgrading = None;
        }
        let at = self.requests.iter().position(|req| req.txn_id == txn_id)?;
        self.requests.remove(at)
    }

    /// Grant the longest compatible run of waiters. Returns how many were
    /// granted.
    pub fn grant_compatible(&mut self) -> usize {
        let mut holders = self.granted_modes();
        let mut newly = 0;
        for req in self.requests.iter_mut().filter(|req| !req.granted) {
            let fits = holders
                .iter()
                .all(|&(holder, held)| holder == req.txn_id || held.is_compatible_with(req.mode));
            if !fits {
                break;
            }
            req.granted = true;
            holders.push((req.txn_id, req.mode));
            newly += 1;
        }
        newly
    }

    pub fn granted_modes(&self) -> GrantedModes {
        self.requests
            .iter()
            .filter(|req| req.granted)
            .map(|req| (req.txn_id, req.mode))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<LockRequestSnapshot> {
        self.requests
            .iter()
            .map(|req| LockRequestSnapshot {
                txn_id: req.txn_id,
                mode: req.mode,
                granted: req.granted,
                upgrade: req.upgrade,
            })
            .collect()
    }
}

/// Requests for one resource plus the condition variable its waiters park on.
#[derive(Debug)]
pub(crate) struct LockRequestQueue {
    pub resource: ResourceId,
    pub state: Mutex<QueueState>,
    pub cv: Condvar,
}

impl LockRequestQueue {
    pub fn new(resource: ResourceId) -> Self {
        Self {
            resource,
            state: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
        }
    }
}
