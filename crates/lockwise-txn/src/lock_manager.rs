//! Multi-granularity lock manager.
//!
//! One [`LockRequestQueue`] per resource, created on first use and dropped
//! from the map once it is empty and nobody else holds it. A request is appended to its queue, the queue
//! runs a FIFO grant pass, and the caller parks on the queue's condition
//! variable until its request is granted or its transaction is aborted.
//!
//! Lock order is: resource map, then one queue mutex, then the transaction's
//! own mutex. No path holds two queue mutexes at once.

use std::collections::HashMap;
use std::sync::Arc;

use lockwise_error::{AbortReason, LockError, Result};
use lockwise_observability::{LockEvent, LockObserver, NoOpObserver};
use lockwise_types::{
    IsolationLevel, LockMode, ResourceId, RowId, TableId, TransactionState, TxnId,
};
use parking_lot::{MutexGuard, RwLock};
use tracing::{debug, warn};

use crate::config::LockManagerConfig;
use crate::deadlock::{DeadlockDetector, WaitsForGraph};
use crate::lock_request_queue::{
    GrantedModes, LockRequest, LockRequestQueue, LockRequestSnapshot, QueueState,
};
use crate::transaction::Transaction;

pub struct LockManager {
    queues: RwLock<HashMap<ResourceId, Arc<LockRequestQueue>>>,
    config: LockManagerConfig,
    observer: Arc<dyn LockObserver>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("resources", &self.resource_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(LockManagerConfig::default())
    }

    #[must_use]
    pub fn with_config(config: LockManagerConfig) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            config,
            observer: Arc::new(NoOpObserver),
        }
    }

    /// Replace the event observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn LockObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    /// Start the background detector if the config enables it.
    #[must_use]
    pub fn start_deadlock_detection(self: &Arc<Self>) -> Option<DeadlockDetector> {
        self.config.enable_cycle_detection.then(|| {
            DeadlockDetector::spawn(Arc::clone(self), self.config.cycle_detection_interval())
        })
    }

    // -- acquire -------------------------------------------------------------

    /// Acquire `mode` on `table`, blocking until granted.
    ///
    /// Re-requesting the held mode returns `Ok(true)` immediately; requesting
    /// a stronger mode upgrades the held lock in place.
    ///
    /// Returns `Ok(false)` when the transaction is already finished or was
    /// aborted while it waited.
    ///
    /// # Errors
    ///
    /// [`LockError::TransactionAbort`] when the request breaks an isolation,
    /// phase or upgrade rule. The transaction is ABORTED before returning.
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        table: TableId,
    ) -> Result<bool> {
        if txn.state().is_terminal() {
            return Ok(false);
        }
        self.check_isolation(txn, mode)?;
        self.acquire(txn, mode, ResourceId::Table(table))
    }

    /// Acquire `mode` (S or X) on one row of `table`.
    ///
    /// S needs any lock on the table. X needs X, IX or SIX on the table.
    ///
    /// # Errors
    ///
    /// As [`Self::lock_table`], plus `AttemptedIntentionLockOnRow` for
    /// intention modes and `TableLockNotPresent` when the table lock is
    /// missing or too weak.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        table: TableId,
        row: RowId,
    ) -> Result<bool> {
        if txn.state().is_terminal() {
            return Ok(false);
        }
        if mode.is_intention() {
            return Err(self.abort(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        self.check_isolation(txn, mode)?;

        let table_mode = txn.table_lock_mode(table);
        let covered = match mode {
            LockMode::Exclusive => matches!(
                table_mode,
                Some(
                    LockMode::Exclusive
                        | LockMode::IntentionExclusive
                        | LockMode::SharedIntentionExclusive
                )
            ),
            _ => table_mode.is_some(),
        };
        if !covered {
            return Err(self.abort(txn, AbortReason::TableLockNotPresent));
        }
        self.acquire(txn, mode, ResourceId::Row(table, row))
    }

    /// Isolation-level and 2PL phase gating, checked before any queueing.
    fn check_isolation(&self, txn: &Arc<Transaction>, mode: LockMode) -> Result<()> {
        let shrinking = txn.state() == TransactionState::Shrinking;
        let reason = match txn.isolation_level() {
            IsolationLevel::ReadUncommitted if mode.is_shared_family() => {
                Some(AbortReason::LockSharedOnReadUncommitted)
            }
            IsolationLevel::ReadUncommitted | IsolationLevel::RepeatableRead if shrinking => {
                Some(AbortReason::LockOnShrinking)
            }
            IsolationLevel::ReadCommitted
                if shrinking
                    && !matches!(mode, LockMode::Shared | LockMode::IntentionShared) =>
            {
                Some(AbortReason::LockOnShrinking)
            }
            _ => None,
        };
        match reason {
            Some(reason) => Err(self.abort(txn, reason)),
            None => Ok(()),
        }
    }

    fn acquire(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        resource: ResourceId,
    ) -> Result<bool> {
        let txn_id = txn.id();
        let queue = self.queue_for(resource);
        let mut state = queue.state.lock();

        let upgrade = match state.get(txn_id).map(|req| req.mode) {
            Some(held) if held == mode => return Ok(true),
            Some(held) => {
                if state.upgrading.is_some_and(|other| other != txn_id) {
                    return Err(self.abort(txn, AbortReason::UpgradeConflict));
                }
                if !held.can_upgrade_to(mode) {
                    return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
                }
                state.remove(txn_id);
                txn.remove_lock(resource);
                state.insert_upgrade(LockRequest::new(txn, mode, true));
                state.upgrading = Some(txn_id);
                debug!(txn = %txn_id, %resource, from = %held, to = %mode, "lock upgrade requested");
                true
            }
            None => {
                state.push_back(LockRequest::new(txn, mode, false));
                false
            }
        };

        if state.grant_compatible() > 0 {
            queue.cv.notify_all();
        }

        let mut announced = false;
        loop {
            if txn.state() == TransactionState::Aborted {
                Self::withdraw(&queue, &mut state, txn_id);
                txn.clear_wait();
                debug!(txn = %txn_id, %resource, "lock wait ended by abort");
                drop(state);
                drop(queue);
                self.prune_queue(resource);
                return Ok(false);
            }
            match state.get(txn_id) {
                Some(req) if req.granted => break,
                Some(_) => {}
                None => {
                    txn.clear_wait();
                    return Ok(false);
                }
            }
            if !txn.register_wait(resource) {
                continue;
            }
            if !announced {
                announced = true;
                debug!(txn = %txn_id, %resource, %mode, "lock wait");
                self.observer.on_event(&LockEvent::Waiting {
                    resource,
                    txn: txn_id,
                    mode,
                });
            }
            queue.cv.wait(&mut state);
        }

        if upgrade {
            state.upgrading = None;
        }
        let waited_ns = state.get(txn_id).map_or(0, |req| {
            u64::try_from(req.enqueued_at.elapsed().as_nanos()).unwrap_or(u64::MAX)
        });
        txn.finish_grant(resource, mode);
        debug!(txn = %txn_id, %resource, %mode, upgrade, "lock granted");
        self.observer.on_event(&LockEvent::Granted {
            resource,
            txn: txn_id,
            mode,
            upgrade,
            waited_ns: if announced { waited_ns } else { 0 },
        });
        Ok(true)
    }

    /// Pull `txn_id`'s request out of a queue and let the next waiters in.
    fn withdraw(queue: &LockRequestQueue, state: &mut MutexGuard<'_, QueueState>, txn_id: TxnId) {
        if state.remove(txn_id).is_some() {
            state.grant_compatible();
            queue.cv.notify_all();
        }
    }

    // -- release -------------------------------------------------------------

    /// Release the lock `txn` holds on `table`.
    ///
    /// Releasing X moves a GROWING transaction to SHRINKING; releasing S does
    /// so only under REPEATABLE_READ. Intention locks never change the phase.
    /// A committed or aborted transaction gets `Ok(false)`; its locks are
    /// released by the transaction manager.
    ///
    /// # Errors
    ///
    /// `TableUnlockedBeforeUnlockingRows` if row locks on the table are still
    /// held, `AttemptedUnlockButNoLockHeld` if nothing is held.
    pub fn unlock_table(&self, txn: &Arc<Transaction>, table: TableId) -> Result<bool> {
        if txn.state().is_terminal() {
            return Ok(false);
        }
        if txn.holds_row_locks_on(table) {
            return Err(self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }
        self.release(txn, ResourceId::Table(table))
    }

    /// Release the row lock `txn` holds on `(table, row)`.
    ///
    /// # Errors
    ///
    /// `AttemptedUnlockButNoLockHeld` if the row is not locked by `txn`.
    pub fn unlock_row(&self, txn: &Arc<Transaction>, table: TableId, row: RowId) -> Result<bool> {
        if txn.state().is_terminal() {
            return Ok(false);
        }
        self.release(txn, ResourceId::Row(table, row))
    }

    fn release(&self, txn: &Arc<Transaction>, resource: ResourceId) -> Result<bool> {
        let txn_id = txn.id();
        let Some(queue) = self.existing_queue(resource) else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let mut state = queue.state.lock();
        let held = match state.get(txn_id) {
            Some(req) if req.granted => req.mode,
            _ => return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld)),
        };

        state.remove(txn_id);
        txn.remove_lock(resource);

        let shrinks = match held {
            LockMode::Exclusive => true,
            LockMode::Shared => txn.isolation_level() == IsolationLevel::RepeatableRead,
            _ => false,
        };
        if shrinks && txn.begin_shrinking() {
            debug!(txn = %txn_id, %resource, mode = %held, "transaction entered shrinking phase");
        }

        state.grant_compatible();
        queue.cv.notify_all();
        drop(state);
        drop(queue);
        self.prune_queue(resource);
        debug!(txn = %txn_id, %resource, mode = %held, "lock released");
        self.observer.on_event(&LockEvent::Released {
            resource,
            txn: txn_id,
            mode: held,
        });
        Ok(true)
    }

    /// Drop `txn`'s claim on `resource` without touching its 2PL phase.
    ///
    /// Used by commit and abort. Removes a pending request as well as a
    /// granted one; silently does nothing if there is neither.
    pub(crate) fn force_release(&self, txn: &Arc<Transaction>, resource: ResourceId) {
        let txn_id = txn.id();
        txn.remove_lock(resource);
        let Some(queue) = self.existing_queue(resource) else {
            return;
        };
        let mut state = queue.state.lock();
        let Some(req) = state.remove(txn_id) else {
            return;
        };
        state.grant_compatible();
        queue.cv.notify_all();
        drop(state);
        drop(queue);
        self.prune_queue(resource);
        if req.granted {
            debug!(txn = %txn_id, %resource, mode = %req.mode, "lock released");
            self.observer.on_event(&LockEvent::Released {
                resource,
                txn: txn_id,
                mode: req.mode,
            });
        }
    }

    /// Release every lock `txn` holds, rows before tables.
    pub(crate) fn release_all(&self, txn: &Arc<Transaction>) {
        let held = txn.held_locks();
        for (resource, _) in held.rows.into_iter().chain(held.tables) {
            self.force_release(txn, resource);
        }
    }

    /// Mark `txn` ABORTED, record why, and build the error for the caller.
    fn abort(&self, txn: &Arc<Transaction>, reason: AbortReason) -> LockError {
        let txn_id = txn.id();
        txn.mark_aborted();
        warn!(txn = %txn_id, %reason, "transaction aborted by lock manager");
        self.observer.on_event(&LockEvent::Aborted {
            txn: txn_id,
            reason,
        });
        LockError::abort(txn_id, reason)
    }

    // -- deadlock detection --------------------------------------------------

    /// Build the current waits-for graph.
    ///
    /// A waiter points at every granted holder it conflicts with and at every
    /// request queued ahead of it that is still waiting.
    #[must_use]
    pub fn waits_for_graph(&self) -> WaitsForGraph {
        self.collect_waiters().0
    }

    fn collect_waiters(&self) -> (WaitsForGraph, HashMap<TxnId, Waiter>) {
        let queues: Vec<_> = self.queues.read().values().cloned().collect();
        let mut graph = WaitsForGraph::new();
        let mut waiters = HashMap::new();
        for queue in queues {
            let state = queue.state.lock();
            for (at, req) in state.requests.iter().enumerate() {
                // Victims from an earlier pass are on their way out.
                if req.granted || req.txn.state() == TransactionState::Aborted {
                    continue;
                }
                for ahead in state.requests.iter().take(at) {
                    if !ahead.granted || !ahead.mode.is_compatible_with(req.mode) {
                        graph.add_edge(req.txn_id, ahead.txn_id);
                    }
                }
                waiters.insert(
                    req.txn_id,
                    Waiter {
                        txn: Arc::clone(&req.txn),
                        queue: Arc::clone(&queue),
                    },
                );
            }
        }
        (graph, waiters)
    }

    /// Run one detection pass: abort the youngest member of each cycle and
    /// wake it. Returns the victims in the order they were chosen.
    ///
    /// The graph is a snapshot. A chosen victim whose request was granted or
    /// withdrawn since then is left alone and the graph is rebuilt.
    pub fn detect_deadlocks_once(&self) -> Vec<TxnId> {
        let (mut graph, mut waiters) = self.collect_waiters();
        let mut victims = Vec::new();
        while let Some(cycle) = graph.find_cycle() {
            let Some(victim) = cycle.iter().copied().max() else {
                break;
            };
            let aborted = waiters
                .get(&victim)
                .is_some_and(|waiter| Self::abort_waiter(waiter, victim));
            if !aborted {
                debug!(txn = %victim, "deadlock victim no longer waiting, rebuilding graph");
                (graph, waiters) = self.collect_waiters();
                continue;
            }
            graph.remove_txn(victim);
            victims.push(victim);

            warn!(txn = %victim, cycle_len = cycle.len(), "deadlock victim chosen");
            self.observer.on_event(&LockEvent::DeadlockVictim {
                txn: victim,
                cycle_len: cycle.len(),
            });
            self.observer.on_event(&LockEvent::Aborted {
                txn: victim,
                reason: AbortReason::Deadlock,
            });
        }
        victims
    }

    /// Abort `victim` and wake its queue, but only while its request is
    /// still queued and not granted. Both checks and the abort happen under
    /// the queue mutex, so the waiter cannot be granted in between.
    fn abort_waiter(waiter: &Waiter, victim: TxnId) -> bool {
        let state = waiter.queue.state.lock();
        let pending = state.get(victim).is_some_and(|req| !req.granted);
        if pending && waiter.txn.id() == victim {
            waiter.txn.mark_aborted();
            waiter.queue.cv.notify_all();
            debug!(txn = %victim, resource = %waiter.queue.resource, "deadlock victim woken");
            true
        } else {
            false
        }
    }

    // -- introspection -------------------------------------------------------

    /// Requests queued on `resource`, front to back.
    #[must_use]
    pub fn queue_snapshot(&self, resource: ResourceId) -> Vec<LockRequestSnapshot> {
        self.existing_queue(resource)
            .map(|queue| queue.state.lock().snapshot())
            .unwrap_or_default()
    }

    /// Granted `(txn, mode)` pairs on `resource`.
    #[must_use]
    pub fn granted_modes(&self, resource: ResourceId) -> GrantedModes {
        self.existing_queue(resource)
            .map(|queue| queue.state.lock().granted_modes())
            .unwrap_or_default()
    }

    /// The transaction with an upgrade in flight on `resource`.
    #[must_use]
    pub fn upgrading(&self, resource: ResourceId) -> Option<TxnId> {
        self.existing_queue(resource)
            .and_then(|queue| queue.state.lock().upgrading)
    }

    /// Number of resources with a live queue. Idle queues are pruned, so
    /// this tracks resources currently locked or waited on.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.queues.read().len()
    }

    // -- queue map -----------------------------------------------------------

    fn existing_queue(&self, resource: ResourceId) -> Option<Arc<LockRequestQueue>> {
        self.queues.read().get(&resource).cloned()
    }

    /// Drop the queue for `resource` if it is empty and only the map holds
    /// it. Callers must not hold a clone of the queue's `Arc`.
    fn prune_queue(&self, resource: ResourceId) {
        let mut queues = self.queues.write();
        // New clones come from the map or from another clone, so a count of
        // one cannot grow while the write lock is held.
        let idle = queues.get(&resource).is_some_and(|queue| {
            Arc::strong_count(queue) == 1 && queue.state.lock().requests.is_empty()
        });
        if idle {
            queues.remove(&resource);
        }
    }

    fn queue_for(&self, resource: ResourceId) -> Arc<LockRequestQueue> {
        if let Some(queue) = self.existing_queue(resource) {
            return queue;
        }
        Arc::clone(
            self.queues
                .write()
                .entry(resource)
                .or_insert_with(|| Arc::new(LockRequestQueue::new(resource))),
        )
    }
}

struct Waiter {
    txn: Arc<Transaction>,
    queue: Arc<LockRequestQueue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    use lockwise_observability::MetricsObserver;

    fn txn(id: u64, isolation: IsolationLevel) -> Arc<Transaction> {
        Arc::new(Transaction::new(TxnId::new(id), isolation))
    }

    fn rr(id: u64) -> Arc<Transaction> {
        txn(id, IsolationLevel::RepeatableRead)
    }

    const T0: TableId = TableId::new(0);
    const R0: RowId = RowId::new(0, 0);

    fn abort_reason(result: Result<bool>) -> AbortReason {
        result.unwrap_err().abort_reason().unwrap()
    }

    #[test]
    fn shared_locks_coexist() {
        let lm = LockManager::new();
        let (a, b) = (rr(0), rr(1));
        assert!(lm.lock_table(&a, LockMode::Shared, T0).unwrap());
        assert!(lm.lock_table(&b, LockMode::Shared, T0).unwrap());
        assert_eq!(lm.granted_modes(ResourceId::Table(T0)).len(), 2);
        assert!(a.is_table_shared_locked(T0));
    }

    #[test]
    fn relock_same_mode_is_noop() {
        let lm = LockManager::new();
        let a = rr(0);
        assert!(lm.lock_table(&a, LockMode::IntentionExclusive, T0).unwrap());
        assert!(lm.lock_table(&a, LockMode::IntentionExclusive, T0).unwrap());
        assert_eq!(lm.queue_snapshot(ResourceId::Table(T0)).len(), 1);
    }

    #[test]
    fn read_uncommitted_rejects_shared_family() {
        let lm = LockManager::new();
        for mode in [
            LockMode::Shared,
            LockMode::IntentionShared,
            LockMode::SharedIntentionExclusive,
        ] {
            let t = txn(0, IsolationLevel::ReadUncommitted);
            assert_eq!(
                abort_reason(lm.lock_table(&t, mode, T0)),
                AbortReason::LockSharedOnReadUncommitted
            );
            assert_eq!(t.state(), TransactionState::Aborted);
        }
        let t = txn(1, IsolationLevel::ReadUncommitted);
        assert!(lm.lock_table(&t, LockMode::IntentionExclusive, T0).unwrap());
    }

    #[test]
    fn read_committed_may_read_while_shrinking() {
        let lm = LockManager::new();
        let t = txn(0, IsolationLevel::ReadCommitted);
        lm.lock_table(&t, LockMode::Exclusive, T0).unwrap();
        lm.unlock_table(&t, T0).unwrap();
        assert_eq!(t.state(), TransactionState::Shrinking);

        let t1 = TableId::new(1);
        assert!(lm.lock_table(&t, LockMode::IntentionShared, t1).unwrap());
        assert!(lm.lock_row(&t, LockMode::Shared, t1, R0).unwrap());
        assert_eq!(
            abort_reason(lm.lock_table(&t, LockMode::IntentionExclusive, TableId::new(2))),
            AbortReason::LockOnShrinking
        );
    }

    #[test]
    fn repeatable_read_shared_unlock_shrinks() {
        let lm = LockManager::new();
        let t = rr(0);
        lm.lock_table(&t, LockMode::Shared, T0).unwrap();
        lm.unlock_table(&t, T0).unwrap();
        assert_eq!(t.state(), TransactionState::Shrinking);
        assert_eq!(
            abort_reason(lm.lock_table(&t, LockMode::IntentionShared, T0)),
            AbortReason::LockOnShrinking
        );
    }

    #[test]
    fn intention_unlock_keeps_growing() {
        let lm = LockManager::new();
        let t = rr(0);
        lm.lock_table(&t, LockMode::IntentionExclusive, T0).unwrap();
        lm.unlock_table(&t, T0).unwrap();
        assert_eq!(t.state(), TransactionState::Growing);

        let rc = txn(1, IsolationLevel::ReadCommitted);
        lm.lock_table(&rc, LockMode::Shared, T0).unwrap();
        lm.unlock_table(&rc, T0).unwrap();
        assert_eq!(rc.state(), TransactionState::Growing);
    }

    #[test]
    fn row_lock_prerequisites() {
        let lm = LockManager::new();
        let t = rr(0);
        assert_eq!(
            abort_reason(lm.lock_row(&t, LockMode::Shared, T0, R0)),
            AbortReason::TableLockNotPresent
        );

        let t = rr(1);
        lm.lock_table(&t, LockMode::IntentionShared, T0).unwrap();
        assert!(lm.lock_row(&t, LockMode::Shared, T0, R0).unwrap());
        assert_eq!(
            abort_reason(lm.lock_row(&t, LockMode::Exclusive, T0, RowId::new(0, 1))),
            AbortReason::TableLockNotPresent
        );

        let t = rr(2);
        lm.lock_table(&t, LockMode::IntentionExclusive, T0).unwrap();
        assert_eq!(
            abort_reason(lm.lock_row(&t, LockMode::IntentionExclusive, T0, R0)),
            AbortReason::AttemptedIntentionLockOnRow
        );
    }

    #[test]
    fn table_unlock_requires_rows_released_first() {
        let lm = LockManager::new();
        let t = rr(0);
        lm.lock_table(&t, LockMode::IntentionExclusive, T0).unwrap();
        lm.lock_row(&t, LockMode::Exclusive, T0, R0).unwrap();
        assert_eq!(
            abort_reason(lm.unlock_table(&t, T0)),
            AbortReason::TableUnlockedBeforeUnlockingRows
        );
        assert!(t.is_table_intention_exclusive_locked(T0));
    }

    #[test]
    fn unlock_without_lock_aborts() {
        let lm = LockManager::new();
        let t = rr(0);
        assert_eq!(
            abort_reason(lm.unlock_table(&t, T0)),
            AbortReason::AttemptedUnlockButNoLockHeld
        );
        let t = rr(1);
        assert_eq!(
            abort_reason(lm.unlock_row(&t, T0, R0)),
            AbortReason::AttemptedUnlockButNoLockHeld
        );
    }

    #[test]
    fn illegal_upgrade_keeps_held_lock() {
        let lm = LockManager::new();
        let t = rr(0);
        lm.lock_table(&t, LockMode::SharedIntentionExclusive, T0).unwrap();
        assert_eq!(
            abort_reason(lm.lock_table(&t, LockMode::IntentionShared, T0)),
            AbortReason::IncompatibleUpgrade
        );
        assert!(t.is_table_shared_intention_exclusive_locked(T0));
    }

    #[test]
    fn upgrade_replaces_held_mode() {
        let lm = LockManager::new();
        let t = rr(0);
        lm.lock_table(&t, LockMode::IntentionShared, T0).unwrap();
        assert!(lm.lock_table(&t, LockMode::Exclusive, T0).unwrap());
        assert!(t.is_table_exclusive_locked(T0));
        assert!(!t.is_table_intention_shared_locked(T0));
        assert_eq!(lm.upgrading(ResourceId::Table(T0)), None);
        let snap = lm.queue_snapshot(ResourceId::Table(T0));
        assert_eq!(snap.len(), 1);
        assert!(snap[0].upgrade && snap[0].granted);
    }

    #[test]
    fn finished_transactions_are_refused_quietly() {
        let lm = LockManager::new();
        let t = rr(0);
        t.mark_committed();
        assert!(!lm.lock_table(&t, LockMode::Shared, T0).unwrap());
        let t = rr(1);
        t.mark_aborted();
        assert!(!lm.lock_row(&t, LockMode::Shared, T0, R0).unwrap());
        assert_eq!(lm.resource_count(), 0);
    }

    #[test]
    fn waiter_granted_after_release() {
        let lm = Arc::new(LockManager::new());
        let holder = rr(0);
        let waiter = rr(1);
        lm.lock_table(&holder, LockMode::Exclusive, T0).unwrap();

        let handle = {
            let lm = Arc::clone(&lm);
            let waiter = Arc::clone(&waiter);
            thread::spawn(move || lm.lock_table(&waiter, LockMode::Shared, T0).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(waiter.waiting_on(), Some(ResourceId::Table(T0)));

        lm.unlock_table(&holder, T0).unwrap();
        assert!(handle.join().unwrap());
        assert!(waiter.is_table_shared_locked(T0));
        assert_eq!(waiter.waiting_on(), None);
    }

    #[test]
    fn force_release_wakes_aborted_waiter() {
        let lm = Arc::new(LockManager::new());
        let holder = rr(0);
        let waiter = rr(1);
        lm.lock_table(&holder, LockMode::Exclusive, T0).unwrap();

        let handle = {
            let lm = Arc::clone(&lm);
            let waiter = Arc::clone(&waiter);
            thread::spawn(move || lm.lock_table(&waiter, LockMode::Exclusive, T0).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        let pending = waiter.mark_aborted();
        assert_eq!(pending, Some(ResourceId::Table(T0)));
        lm.force_release(&waiter, ResourceId::Table(T0));

        assert!(!handle.join().unwrap());
        assert!(!waiter.holds_any_lock());
        assert_eq!(lm.queue_snapshot(ResourceId::Table(T0)).len(), 1);
    }

    #[test]
    fn detection_picks_youngest_and_unblocks() {
        let observer = Arc::new(MetricsObserver::new(64));
        let lm = Arc::new(LockManager::new().with_observer(observer.clone()));
        let (a, b) = (TableId::new(1), TableId::new(2));
        let old = rr(0);
        let young = rr(1);
        lm.lock_table(&old, LockMode::Exclusive, a).unwrap();
        lm.lock_table(&young, LockMode::Exclusive, b).unwrap();

        let spawn_lock = |txn: &Arc<Transaction>, table| {
            let lm = Arc::clone(&lm);
            let txn = Arc::clone(txn);
            thread::spawn(move || lm.lock_table(&txn, LockMode::Exclusive, table).unwrap())
        };
        let old_wait = spawn_lock(&old, b);
        let young_wait = spawn_lock(&young, a);
        thread::sleep(Duration::from_millis(50));

        assert_eq!(
            lm.waits_for_graph().edge_list(),
            vec![(TxnId::new(0), TxnId::new(1)), (TxnId::new(1), TxnId::new(0))]
        );
        assert_eq!(lm.detect_deadlocks_once(), vec![TxnId::new(1)]);
        assert!(!young_wait.join().unwrap());
        assert_eq!(young.state(), TransactionState::Aborted);

        lm.release_all(&young);
        assert!(old_wait.join().unwrap());
        assert!(old.is_table_exclusive_locked(b));
        assert_eq!(observer.metrics().snapshot().deadlock_victims, 1);
        assert_eq!(observer.metrics().aborts_for(AbortReason::Deadlock), 1);
    }

    #[test]
    fn granted_request_is_never_made_a_victim() {
        let lm = LockManager::new();
        let t = rr(0);
        lm.lock_table(&t, LockMode::Exclusive, T0).unwrap();
        let waiter = Waiter {
            txn: Arc::clone(&t),
            queue: lm.queue_for(ResourceId::Table(T0)),
        };
        // A grant that lands after the graph snapshot must win.
        assert!(!LockManager::abort_waiter(&waiter, t.id()));
        assert_eq!(t.state(), TransactionState::Growing);
        assert!(lm.lock_table(&t, LockMode::Exclusive, T0).unwrap());
    }

    #[test]
    fn pending_request_is_aborted_and_woken() {
        let lm = Arc::new(LockManager::new());
        let holder = rr(0);
        let waiter = rr(1);
        lm.lock_table(&holder, LockMode::Exclusive, T0).unwrap();
        let handle = {
            let lm = Arc::clone(&lm);
            let waiter = Arc::clone(&waiter);
            thread::spawn(move || lm.lock_table(&waiter, LockMode::Shared, T0).unwrap())
        };
        thread::sleep(Duration::from_millis(50));

        let entry = Waiter {
            txn: Arc::clone(&waiter),
            queue: lm.queue_for(ResourceId::Table(T0)),
        };
        assert!(LockManager::abort_waiter(&entry, waiter.id()));
        assert!(!handle.join().unwrap());
        assert_eq!(waiter.state(), TransactionState::Aborted);
        // Gone from the queue, so a second pick is refused.
        assert!(!LockManager::abort_waiter(&entry, waiter.id()));
        assert_eq!(lm.granted_modes(ResourceId::Table(T0)).len(), 1);
    }

    #[test]
    fn idle_queues_are_pruned() {
        let lm = LockManager::new();
        let t = rr(0);
        lm.lock_table(&t, LockMode::IntentionExclusive, T0).unwrap();
        for slot in 0..8 {
            lm.lock_row(&t, LockMode::Exclusive, T0, RowId::new(0, slot)).unwrap();
        }
        assert_eq!(lm.resource_count(), 9);

        for slot in 0..8 {
            lm.unlock_row(&t, T0, RowId::new(0, slot)).unwrap();
        }
        assert_eq!(lm.resource_count(), 1);
        lm.release_all(&t);
        assert_eq!(lm.resource_count(), 0);
        assert!(lm.queue_snapshot(ResourceId::Table(T0)).is_empty());
    }

    #[test]
    fn queue_held_elsewhere_survives_pruning() {
        let lm = LockManager::new();
        let t = rr(0);
        lm.lock_table(&t, LockMode::Shared, T0).unwrap();
        let held = lm.queue_for(ResourceId::Table(T0));
        lm.unlock_table(&t, T0).unwrap();
        assert_eq!(lm.resource_count(), 1);
        drop(held);
        lm.prune_queue(ResourceId::Table(T0));
        assert_eq!(lm.resource_count(), 0);
    }

    #[test]
    fn observer_sees_grants_and_releases() {
        let observer = Arc::new(MetricsObserver::new(16));
        let lm = LockManager::new().with_observer(observer.clone());
        let t = rr(0);
        lm.lock_table(&t, LockMode::IntentionShared, T0).unwrap();
        lm.lock_table(&t, LockMode::Shared, T0).unwrap();
        lm.unlock_table(&t, T0).unwrap();

        let snap = observer.metrics().snapshot();
        assert_eq!(snap.grants, 2);
        assert_eq!(snap.upgrades, 1);
        assert_eq!(snap.releases, 1);
        assert_eq!(observer.log().len(), 3);
    }
}
