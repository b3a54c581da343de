//! Public API facade for lockwise.
//!
//! Re-exports the lock vocabulary, errors, observers and the lock and
//! transaction managers, plus [`open`] for the common setup.

use std::sync::Arc;

pub use lockwise_error::{AbortReason, ErrorCode, LockError, Result};
pub use lockwise_observability::{
    LockEvent, LockEventLog, LockMetrics, LockMetricsSnapshot, LockObserver, MetricsObserver,
    NoOpObserver,
};
pub use lockwise_txn::{
    DeadlockDetector, GrantedModes, LockManager, LockManagerConfig, LockRequestSnapshot,
    TableLockCounts, Transaction, TransactionManager, WaitsForGraph,
};
pub use lockwise_types::{
    IsolationLevel, LockMode, ResourceId, RowId, TableId, TransactionState, TxnId,
};

/// Build a lock manager from `config` and a transaction manager over it.
///
/// The deadlock detector runs when `config.enable_cycle_detection` is set and
/// stops when the returned manager is dropped.
#[must_use]
pub fn open(config: LockManagerConfig) -> TransactionManager {
    TransactionManager::with_deadlock_detection(Arc::new(LockManager::with_config(config)))
}

/// Like [`open`], with every lock event sent to `observer`.
#[must_use]
pub fn open_observed(
    config: LockManagerConfig,
    observer: Arc<dyn LockObserver>,
) -> TransactionManager {
    TransactionManager::with_deadlock_detection(Arc::new(
        LockManager::with_config(config).with_observer(observer),
    ))
}
