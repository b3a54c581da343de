//! Transaction lifecycle: begin, commit, abort.
//!
//! The manager allocates ids, keeps a table of running transactions, and on
//! commit or abort releases every lock the transaction still holds (rows
//! first, then tables) before moving it to its terminal state. Finished
//! transactions are dropped from the table.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lockwise_error::{LockError, Result};
use lockwise_types::{IsolationLevel, TransactionState, TxnId};
use parking_lot::RwLock;

use crate::deadlock::DeadlockDetector;
use crate::lock_manager::LockManager;
use crate::transaction::Transaction;

#[derive(Debug)]
pub struct TransactionManager {
    lock_manager: Arc<LockManager>,
    next_txn_id: AtomicU64,
    txn_map: RwLock<HashMap<TxnId, Arc<Transaction>>>,
    detector: Option<DeadlockDetector>,
}

impl TransactionManager {
    /// Manager without background deadlock detection.
    #[must_use]
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            lock_manager,
            next_txn_id: AtomicU64::new(TxnId::FIRST.get()),
            txn_map: RwLock::new(HashMap::new()),
            detector: None,
        }
    }

    /// Manager that also runs the deadlock detector when the lock manager's
    /// config enables it.
    #[must_use]
    pub fn with_deadlock_detection(lock_manager: Arc<LockManager>) -> Self {
        let detector = lock_manager.start_deadlock_detection();
        Self {
            detector,
            ..Self::new(lock_manager)
        }
    }

    #[must_use]
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    #[must_use]
    pub fn is_detecting_deadlocks(&self) -> bool {
        self.detector.as_ref().is_some_and(DeadlockDetector::is_running)
    }

    fn alloc_txn_id(&self) -> TxnId {
        TxnId::new(self.next_txn_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Start a new transaction in the GROWING state.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn = Arc::new(Transaction::new(self.alloc_txn_id(), isolation_level));
        self.register(&txn);
        tracing::info!(txn_id = %txn.id(), %isolation_level, "transaction begun");
        txn
    }

    /// Start a new transaction reusing a finished handle. The handle gets a
    /// fresh id and empty lock sets.
    ///
    /// A handle the lock manager aborted without a follow-up [`Self::abort`]
    /// still owns queue entries; those are released before the reset.
    ///
    /// # Errors
    ///
    /// [`LockError::TransactionStillActive`] if `txn` has not committed or
    /// aborted yet.
    pub fn begin_with(
        &self,
        txn: &Arc<Transaction>,
        isolation_level: IsolationLevel,
    ) -> Result<()> {
        if !txn.state().is_terminal() {
            return Err(LockError::TransactionStillActive { txn_id: txn.id() });
        }
        let previous = txn.id();
        if txn.state() == TransactionState::Aborted {
            self.abort(txn);
        }
        txn.reset(self.alloc_txn_id(), isolation_level);
        self.register(txn);
        tracing::info!(
            txn_id = %txn.id(),
            previous_txn_id = %previous,
            %isolation_level,
            "transaction begun on reused handle"
        );
        Ok(())
    }

    /// Release all locks and mark the transaction COMMITTED.
    ///
    /// # Errors
    ///
    /// [`LockError::TransactionNotActive`] if the transaction already
    /// committed or aborted.
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<()> {
        let state = txn.state();
        if state.is_terminal() {
            return Err(LockError::TransactionNotActive {
                txn_id: txn.id(),
                state,
            });
        }
        self.lock_manager.release_all(txn);
        txn.mark_committed();
        self.unregister(txn.id());
        tracing::info!(txn_id = %txn.id(), "transaction committed");
        Ok(())
    }

    /// Mark the transaction ABORTED, cancel any pending lock request, and
    /// release everything it holds. Aborting twice is harmless.
    pub fn abort(&self, txn: &Arc<Transaction>) {
        let was = txn.state();
        if was == TransactionState::Committed {
            tracing::warn!(txn_id = %txn.id(), "abort ignored for committed transaction");
            return;
        }
        if let Some(pending) = txn.mark_aborted() {
            // Wakes a session still parked on this resource.
            self.lock_manager.force_release(txn, pending);
        }
        self.lock_manager.release_all(txn);
        self.unregister(txn.id());
        if was != TransactionState::Aborted {
            tracing::info!(txn_id = %txn.id(), "transaction aborted");
        }
    }

    /// A running transaction by id.
    #[must_use]
    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.txn_map.read().get(&txn_id).cloned()
    }

    /// Number of transactions that have begun but not finished.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.txn_map.read().len()
    }

    fn register(&self, txn: &Arc<Transaction>) {
        self.txn_map.write().insert(txn.id(), Arc::clone(txn));
    }

    fn unregister(&self, txn_id: TxnId) {
        self.txn_map.write().remove(&txn_id);
    }
}
