//! Lock modes, isolation levels and the 2PL phase of a transaction.

use std::fmt;

/// Multi-granularity lock modes.
///
/// Intention modes (`IntentionShared`, `IntentionExclusive`,
/// `SharedIntentionExclusive`) are only valid on tables.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum LockMode {
    Shared,
    Exclusive,
    IntentionShared,
    IntentionExclusive,
    SharedIntentionExclusive,
}

impl LockMode {
    /// Every mode, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Shared,
        Self::Exclusive,
        Self::IntentionShared,
        Self::IntentionExclusive,
        Self::SharedIntentionExclusive,
    ];

    /// Compatibility matrix: may `self` (held by one transaction) coexist
    /// with `other` (held or requested by a different transaction)?
    ///
    /// ```text
    ///          IS   IX   S    SIX  X
    ///   IS     y    y    y    y    n
    ///   IX     y    y    n    n    n
    ///   S      y    n    y    n    n
    ///   SIX    y    n    n    n    n
    ///   X      n    n    n    n    n
    /// ```
    #[must_use]
    pub const fn is_compatible_with(self, other: Self) -> bool {
        use LockMode::{
            Exclusive, IntentionExclusive, IntentionShared, Shared, SharedIntentionExclusive,
        };
        match (self, other) {
            (Exclusive, _) | (_, Exclusive) => false,
            (IntentionShared, _) | (_, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) | (Shared, Shared) => true,
            (IntentionExclusive | Shared | SharedIntentionExclusive, _) => false,
        }
    }

    /// Legal upgrade paths: IS → {S, X, IX, SIX}, S → {X, SIX},
    /// IX → {X, SIX}, SIX → {X}.
    #[must_use]
    pub const fn can_upgrade_to(self, target: Self) -> bool {
        use LockMode::{
            Exclusive, IntentionExclusive, IntentionShared, Shared, SharedIntentionExclusive,
        };
        matches!(
            (self, target),
            (
                IntentionShared,
                Shared | Exclusive | IntentionExclusive | SharedIntentionExclusive
            ) | (Shared | IntentionExclusive, Exclusive | SharedIntentionExclusive)
                | (SharedIntentionExclusive, Exclusive)
        )
    }

    #[must_use]
    pub const fn is_intention(self) -> bool {
        matches!(
            self,
            Self::IntentionShared | Self::IntentionExclusive | Self::SharedIntentionExclusive
        )
    }

    /// Modes that read-uncommitted transactions may never take.
    #[must_use]
    pub const fn is_shared_family(self) -> bool {
        matches!(
            self,
            Self::Shared | Self::IntentionShared | Self::SharedIntentionExclusive
        )
    }

    /// Short conventional name (`S`, `X`, `IS`, `IX`, `SIX`).
    #[must_use]
    pub const fn abbrev(self) -> &'static str {
        match self {
            Self::Shared => "S",
            Self::Exclusive => "X",
            Self::IntentionShared => "IS",
            Self::IntentionExclusive => "IX",
            Self::SharedIntentionExclusive => "SIX",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abbrev())
    }
}

/// Isolation level governing which lock modes a transaction may take and
/// when it enters the shrinking phase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum IsolationLevel {
    /// Never takes shared-family locks.
    ReadUncommitted,
    /// Shared locks may be released early without ending the growing phase.
    ReadCommitted,
    /// Strict two-phase locking.
    #[default]
    RepeatableRead,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadUncommitted => "READ_UNCOMMITTED",
            Self::ReadCommitted => "READ_COMMITTED",
            Self::RepeatableRead => "REPEATABLE_READ",
        })
    }
}

/// Two-phase-locking state of a transaction.
///
/// `Growing → {Shrinking, Committed, Aborted}`, `Shrinking → {Committed,
/// Aborted}`. `Committed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

impl TransactionState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Growing, Self::Shrinking | Self::Committed | Self::Aborted)
                | (Self::Shrinking, Self::Committed | Self::Aborted)
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Growing => "GROWING",
            Self::Shrinking => "SHRINKING",
            Self::Committed => "COMMITTED",
            Self::Aborted => "ABORTED",
        })
    }
}
