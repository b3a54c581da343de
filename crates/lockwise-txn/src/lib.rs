//! Multi-granularity locking with strict two-phase-locking transactions.
//!
//! [`LockManager`] grants table and row locks in S, X, IS, IX and SIX modes
//! through per-resource FIFO queues. [`TransactionManager`] owns transaction
//! ids and the begin/commit/abort lifecycle, releasing locks on the way out.

pub mod config;
pub mod deadlock;
pub mod lock_manager;
pub mod lock_request_queue;
pub mod transaction;
pub mod txn_manager;

pub use config::{DEFAULT_CYCLE_DETECTION_INTERVAL_MS, LockManagerConfig};
pub use deadlock::{DeadlockDetector, WaitsForGraph};
pub use lock_manager::LockManager;
pub use lock_request_queue::{GrantedModes, LockRequestSnapshot};
pub use transaction::{TableLockCounts, Transaction};
pub use txn_manager::TransactionManager;
