//! Waits-for graph and the background deadlock detector.
//!
//! An edge `a → b` means transaction `a` is blocked behind `b`. Cycle search
//! is deterministic: it starts from the lowest transaction id and visits
//! neighbours in ascending order. When a cycle is found the youngest member
//! (highest id) is reported as the victim.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use lockwise_types::TxnId;
use tracing::{debug, error};

use crate::lock_manager::LockManager;

// ---------------------------------------------------------------------------
// WaitsForGraph
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WaitsForGraph {
    edges: BTreeMap<TxnId, BTreeSet<TxnId>>,
}

impl WaitsForGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `waiter` waits for `holder`. Self-edges are ignored.
    pub fn add_edge(&mut self, waiter: TxnId, holder: TxnId) {
        if waiter != holder {
            self.edges.entry(waiter).or_default().insert(holder);
        }
    }

    pub fn remove_edge(&mut self, waiter: TxnId, holder: TxnId) {
        if let Some(targets) = self.edges.get_mut(&waiter) {
            targets.remove(&holder);
            if targets.is_empty() {
                self.edges.remove(&waiter);
            }
        }
    }

    /// Drop `txn` and every edge touching it.
    pub fn remove_txn(&mut self, txn: TxnId) {
        self.edges.remove(&txn);
        self.edges.retain(|_, targets| {
            targets.remove(&txn);
            !targets.is_empty()
        });
    }

    /// All edges in `(waiter, holder)` order.
    #[must_use]
    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        self.edges
            .iter()
            .flat_map(|(&waiter, targets)| targets.iter().map(move |&holder| (waiter, holder)))
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Find a cycle and return its youngest member.
    #[must_use]
    pub fn has_cycle(&self) -> Option<TxnId> {
        self.find_cycle()
            .and_then(|cycle| cycle.iter().copied().max())
    }

    /// Members of the first cycle found, in path order.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<TxnId>> {
        let mut done = BTreeSet::new();
        let mut path = Vec::new();
        for &start in self.edges.keys() {
            if done.contains(&start) {
                continue;
            }
            if let Some(cycle) = self.dfs(start, &mut done, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs(
        &self,
        node: TxnId,
        done: &mut BTreeSet<TxnId>,
        path: &mut Vec<TxnId>,
    ) -> Option<Vec<TxnId>> {
        path.push(node);
        if let Some(targets) = self.edges.get(&node) {
            for &next in targets {
                if let Some(at) = path.iter().position(|&t| t == next) {
                    return Some(path[at..].to_vec());
                }
                if !done.contains(&next) {
                    if let Some(cycle) = self.dfs(next, done, path) {
                        return Some(cycle);
                    }
                }
            }
        }
        path.pop();
        done.insert(node);
        None
    }
}

// ---------------------------------------------------------------------------
// DeadlockDetector
// ---------------------------------------------------------------------------

/// Handle to the background detection thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct DeadlockDetector {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeadlockDetector {
    /// Run [`LockManager::detect_deadlocks_once`] every `interval` until
    /// stopped.
    #[must_use]
    pub fn spawn(lock_manager: Arc<LockManager>, interval: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            debug!(?interval, "deadlock detector started");
            while !flag.load(Ordering::Acquire) {
                thread::park_timeout(interval);
                if flag.load(Ordering::Acquire) {
                    break;
                }
                lock_manager.detect_deadlocks_once();
            }
            debug!("deadlock detector stopped");
        });
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                error!("deadlock detector thread panicked");
            }
        }
    }
}

impl Drop for DeadlockDetector {
    fn drop(&mut self) {
        self.stop();
    }
}
