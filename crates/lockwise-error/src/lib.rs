use lockwise_types::{TransactionState, TxnId};
use thiserror::Error;

/// Why a transaction was aborted by the lock manager.
///
/// Every variant except [`AbortReason::Deadlock`] is detected synchronously
/// at the call site, before the caller blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AbortReason {
    /// Lock requested in a phase the isolation level forbids.
    LockOnShrinking,
    /// Another upgrade is already in flight on the same resource.
    UpgradeConflict,
    /// S, IS or SIX requested under READ_UNCOMMITTED.
    LockSharedOnReadUncommitted,
    /// Row lock requested without a sufficient lock on the owning table.
    TableLockNotPresent,
    /// IS, IX or SIX requested on a row.
    AttemptedIntentionLockOnRow,
    /// Table unlocked while row locks under it are still held.
    TableUnlockedBeforeUnlockingRows,
    /// Requested mode is not on a legal upgrade path from the held mode.
    IncompatibleUpgrade,
    /// Unlock of a resource the transaction does not hold.
    AttemptedUnlockButNoLockHeld,
    /// Chosen as victim by the deadlock detector.
    Deadlock,
}

impl AbortReason {
    /// Every reason, in declaration order.
    pub const ALL: [Self; 9] = [
        Self::LockOnShrinking,
        Self::UpgradeConflict,
        Self::LockSharedOnReadUncommitted,
        Self::TableLockNotPresent,
        Self::AttemptedIntentionLockOnRow,
        Self::TableUnlockedBeforeUnlockingRows,
        Self::IncompatibleUpgrade,
        Self::AttemptedUnlockButNoLockHeld,
        Self::Deadlock,
    ];

    /// Stable snake-case label, used as a metrics key.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LockOnShrinking => "lock_on_shrinking",
            Self::UpgradeConflict => "upgrade_conflict",
            Self::LockSharedOnReadUncommitted => "lock_shared_on_read_uncommitted",
            Self::TableLockNotPresent => "table_lock_not_present",
            Self::AttemptedIntentionLockOnRow => "attempted_intention_lock_on_row",
            Self::TableUnlockedBeforeUnlockingRows => "table_unlocked_before_unlocking_rows",
            Self::IncompatibleUpgrade => "incompatible_upgrade",
            Self::AttemptedUnlockButNoLockHeld => "attempted_unlock_but_no_lock_held",
            Self::Deadlock => "deadlock",
        }
    }

    /// Whether the abort came from isolation/phase gating rather than from
    /// lock ordering or upgrade rules.
    pub const fn is_protocol_violation(self) -> bool {
        matches!(
            self,
            Self::LockOnShrinking | Self::LockSharedOnReadUncommitted
        )
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::LockOnShrinking => "lock requested while shrinking",
            Self::UpgradeConflict => "another lock upgrade is already in progress",
            Self::LockSharedOnReadUncommitted => "shared lock requested under READ_UNCOMMITTED",
            Self::TableLockNotPresent => "row lock requested without a sufficient table lock",
            Self::AttemptedIntentionLockOnRow => "intention lock requested on a row",
            Self::TableUnlockedBeforeUnlockingRows => {
                "table unlocked before its row locks were released"
            }
            Self::IncompatibleUpgrade => "illegal lock upgrade",
            Self::AttemptedUnlockButNoLockHeld => "unlock requested but no lock is held",
            Self::Deadlock => "chosen as deadlock victim",
        };
        f.write_str(text)
    }
}

/// Primary error type for lockwise operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The lock manager aborted the transaction. The transaction is already in
    /// the ABORTED state; the caller must still run the transaction manager's
    /// abort to release whatever it holds.
    #[error("transaction {txn_id} aborted: {reason}")]
    TransactionAbort { txn_id: TxnId, reason: AbortReason },

    /// Commit requested for a transaction that already finished.
    #[error("transaction {txn_id} is not active (state: {state})")]
    TransactionNotActive {
        txn_id: TxnId,
        state: TransactionState,
    },

    /// A handle was handed back to `begin` while still running.
    #[error("transaction {txn_id} is still active and cannot be reused")]
    TransactionStillActive { txn_id: TxnId },
}

/// Stable numeric codes for callers that surface lock failures across an
/// FFI or wire boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Transaction aborted by the lock manager.
    Abort = 4,
    /// Lock could not be granted because of a deadlock.
    Locked = 6,
    /// Locking protocol misuse (phase or isolation violation).
    Protocol = 15,
    /// Library used incorrectly.
    Misuse = 21,
}

impl LockError {
    /// Build the abort error for `txn_id`.
    pub const fn abort(txn_id: TxnId, reason: AbortReason) -> Self {
        Self::TransactionAbort { txn_id, reason }
    }

    /// The abort reason, when this is a lock-manager abort.
    pub const fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Self::TransactionAbort { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Whether the transaction was aborted (and must be cleaned up with abort).
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::TransactionAbort { .. })
    }

    /// The transaction the error refers to.
    pub const fn txn_id(&self) -> TxnId {
        match self {
            Self::TransactionAbort { txn_id, .. }
            | Self::TransactionNotActive { txn_id, .. }
            | Self::TransactionStillActive { txn_id } => *txn_id,
        }
    }

    /// Map this error to a stable code.
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::TransactionAbort { reason, .. } => {
                if reason.is_protocol_violation() {
                    ErrorCode::Protocol
                } else if matches!(reason, AbortReason::Deadlock) {
                    ErrorCode::Locked
                } else {
                    ErrorCode::Abort
                }
            }
            Self::TransactionNotActive { .. } | Self::TransactionStillActive { .. } => {
                ErrorCode::Misuse
            }
        }
    }

    /// Whether retrying the whole transaction from scratch may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransactionAbort {
                reason: AbortReason::Deadlock | AbortReason::UpgradeConflict,
                ..
            }
        )
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::TransactionAbort { reason, .. } => match reason {
                AbortReason::Deadlock | AbortReason::UpgradeConflict => {
                    Some("Abort and retry the transaction")
                }
                AbortReason::TableUnlockedBeforeUnlockingRows => {
                    Some("Release row locks before the lock on their table")
                }
                AbortReason::TableLockNotPresent => {
                    Some("Take an intention lock on the table before locking rows")
                }
                AbortReason::LockSharedOnReadUncommitted => {
                    Some("Use READ_COMMITTED or stronger to take shared locks")
                }
                _ => None,
            },
            Self::TransactionNotActive { .. } => Some("Begin a new transaction"),
            _ => None,
        }
    }
}

/// Result type alias using `LockError`.
pub type Result<T> = std::result::Result<T, LockError>;
