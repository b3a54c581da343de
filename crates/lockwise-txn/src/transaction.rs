//! Per-transaction lock bookkeeping and 2PL state.
//!
//! A [`Transaction`] is shared (`Arc`) between the session thread driving it,
//! the transaction manager, and lock requests queued on its behalf. All
//! mutable state sits behind one mutex. The lock manager only touches it while
//! holding the queue mutex of the resource concerned, so the lock order is
//! always queue → transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use lockwise_types::{IsolationLevel, LockMode, ResourceId, RowId, TableId, TransactionState, TxnId};
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// LockSets
// ---------------------------------------------------------------------------

/// Held locks, partitioned by granularity and mode.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct LockSets {
    shared_tables: BTreeSet<TableId>,
    exclusive_tables: BTreeSet<TableId>,
    intention_shared_tables: BTreeSet<TableId>,
    intention_exclusive_tables: BTreeSet<TableId>,
    shared_intention_exclusive_tables: BTreeSet<TableId>,
    shared_rows: BTreeMap<TableId, BTreeSet<RowId>>,
    exclusive_rows: BTreeMap<TableId, BTreeSet<RowId>>,
}

impl LockSets {
    fn table_set(&self, mode: LockMode) -> &BTreeSet<TableId> {
        match mode {
            LockMode::Shared => &self.shared_tables,
            LockMode::Exclusive => &self.exclusive_tables,
            LockMode::IntentionShared => &self.intention_shared_tables,
            LockMode::IntentionExclusive => &self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &self.shared_intention_exclusive_tables,
        }
    }

    fn table_set_mut(&mut self, mode: LockMode) -> &mut BTreeSet<TableId> {
        match mode {
            LockMode::Shared => &mut self.shared_tables,
            LockMode::Exclusive => &mut self.exclusive_tables,
            LockMode::IntentionShared => &mut self.intention_shared_tables,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_tables,
        }
    }

    fn table_mode(&self, table: TableId) -> Option<LockMode> {
        LockMode::ALL
            .into_iter()
            .find(|&mode| self.table_set(mode).contains(&table))
    }

    fn row_mode(&self, table: TableId, row: RowId) -> Option<LockMode> {
        let holds = |map: &BTreeMap<TableId, BTreeSet<RowId>>| {
            map.get(&table).is_some_and(|rows| rows.contains(&row))
        };
        if holds(&self.exclusive_rows) {
            Some(LockMode::Exclusive)
        } else if holds(&self.shared_rows) {
            Some(LockMode::Shared)
        } else {
            None
        }
    }

    fn insert(&mut self, resource: ResourceId, mode: LockMode) {
        // One mode per resource: drop whatever was there first.
        self.remove(resource);
        match resource {
            ResourceId::Table(table) => {
                self.table_set_mut(mode).insert(table);
            }
            ResourceId::Row(table, row) => {
                let map = if mode == LockMode::Exclusive {
                    &mut self.exclusive_rows
                } else {
                    &mut self.shared_rows
                };
                map.entry(table).or_default().insert(row);
            }
        }
    }

    fn remove(&mut self, resource: ResourceId) -> Option<LockMode> {
        match resource {
            ResourceId::Table(table) => {
                let mode = self.table_mode(table)?;
                self.table_set_mut(mode).remove(&table);
                Some(mode)
            }
            ResourceId::Row(table, row) => {
                let mode = self.row_mode(table, row)?;
                let map = if mode == LockMode::Exclusive {
                    &mut self.exclusive_rows
                } else {
                    &mut self.shared_rows
                };
                if let Some(rows) = map.get_mut(&table) {
                    rows.remove(&row);
                    if rows.is_empty() {
                        map.remove(&table);
                    }
                }
                Some(mode)
            }
        }
    }

    fn has_rows_on(&self, table: TableId) -> bool {
        let non_empty = |map: &BTreeMap<TableId, BTreeSet<RowId>>| {
            map.get(&table).is_some_and(|rows| !rows.is_empty())
        };
        non_empty(&self.shared_rows) || non_empty(&self.exclusive_rows)
    }

    fn held(&self) -> HeldLocks {
        let mut rows = Vec::new();
        for (mode, map) in [
            (LockMode::Shared, &self.shared_rows),
            (LockMode::Exclusive, &self.exclusive_rows),
        ] {
            for (&table, set) in map {
                rows.extend(set.iter().map(|&row| (ResourceId::Row(table, row), mode)));
            }
        }
        let tables = LockMode::ALL
            .into_iter()
            .flat_map(|mode| {
                self.table_set(mode)
                    .iter()
                    .map(move |&table| (ResourceId::Table(table), mode))
            })
            .collect();
        HeldLocks { rows, tables }
    }

    fn counts(&self) -> TableLockCounts {
        TableLockCounts {
            shared: self.shared_tables.len(),
            exclusive: self.exclusive_tables.len(),
            intention_shared: self.intention_shared_tables.len(),
            intention_exclusive: self.intention_exclusive_tables.len(),
            shared_intention_exclusive: self.shared_intention_exclusive_tables.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.counts() == TableLockCounts::default()
            && self.shared_rows.values().all(BTreeSet::is_empty)
            && self.exclusive_rows.values().all(BTreeSet::is_empty)
    }
}

/// Snapshot of held locks, rows listed separately so they can be released
/// before the tables that own them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct HeldLocks {
    pub rows: Vec<(ResourceId, LockMode)>,
    pub tables: Vec<(ResourceId, LockMode)>,
}

/// Sizes of the five table lock sets.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct TableLockCounts {
    pub shared: usize,
    pub exclusive: usize,
    pub intention_shared: usize,
    pub intention_exclusive: usize,
    pub shared_intention_exclusive: usize,
}

impl TableLockCounts {
    /// Build from `(S, X, IS, IX, SIX)`.
    #[must_use]
    pub const fn new(
        shared: usize,
        exclusive: usize,
        intention_shared: usize,
        intention_exclusive: usize,
        shared_intention_exclusive: usize,
    ) -> Self {
        Self {
            shared,
            exclusive,
            intention_shared,
            intention_exclusive,
            shared_intention_exclusive,
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

struct TxnInner {
    state: TransactionState,
    isolation_level: IsolationLevel,
    locks: LockSets,
    /// Resource this transaction is currently blocked on, if any.
    waiting_on: Option<ResourceId>,
}

/// A transaction as seen by the lock manager.
pub struct Transaction {
    id: AtomicU64,
    inner: Mutex<TxnInner>,
}

impl Transaction {
    pub(crate) fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id: AtomicU64::new(id.get()),
            inner: Mutex::new(TxnInner {
                state: TransactionState::Growing,
                isolation_level,
                locks: LockSets::default(),
                waiting_on: None,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> TxnId {
        TxnId::new(self.id.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn isolation_level(&self) -> IsolationLevel {
        self.inner.lock().isolation_level
    }

    // -- table lock sets ---------------------------------------------------

    #[must_use]
    pub fn shared_table_locks(&self) -> BTreeSet<TableId> {
        self.table_locks(LockMode::Shared)
    }

    #[must_use]
    pub fn exclusive_table_locks(&self) -> BTreeSet<TableId> {
        self.table_locks(LockMode::Exclusive)
    }

    #[must_use]
    pub fn intention_shared_table_locks(&self) -> BTreeSet<TableId> {
        self.table_locks(LockMode::IntentionShared)
    }

    #[must_use]
    pub fn intention_exclusive_table_locks(&self) -> BTreeSet<TableId> {
        self.table_locks(LockMode::IntentionExclusive)
    }

    #[must_use]
    pub fn shared_intention_exclusive_table_locks(&self) -> BTreeSet<TableId> {
        self.table_locks(LockMode::SharedIntentionExclusive)
    }

    /// Tables held in exactly `mode`.
    #[must_use]
    pub fn table_locks(&self, mode: LockMode) -> BTreeSet<TableId> {
        self.inner.lock().locks.table_set(mode).clone()
    }

    /// The mode this transaction holds on `table`, if any.
    #[must_use]
    pub fn table_lock_mode(&self, table: TableId) -> Option<LockMode> {
        self.inner.lock().locks.table_mode(table)
    }

    #[must_use]
    pub fn is_table_shared_locked(&self, table: TableId) -> bool {
        self.table_lock_mode(table) == Some(LockMode::Shared)
    }

    #[must_use]
    pub fn is_table_exclusive_locked(&self, table: TableId) -> bool {
        self.table_lock_mode(table) == Some(LockMode::Exclusive)
    }

    #[must_use]
    pub fn is_table_intention_shared_locked(&self, table: TableId) -> bool {
        self.table_lock_mode(table) == Some(LockMode::IntentionShared)
    }

    #[must_use]
    pub fn is_table_intention_exclusive_locked(&self, table: TableId) -> bool {
        self.table_lock_mode(table) == Some(LockMode::IntentionExclusive)
    }

    #[must_use]
    pub fn is_table_shared_intention_exclusive_locked(&self, table: TableId) -> bool {
        self.table_lock_mode(table) == Some(LockMode::SharedIntentionExclusive)
    }

    // -- row lock sets -----------------------------------------------------

    /// Rows of `table` held in shared mode (empty if none).
    #[must_use]
    pub fn shared_row_locks(&self, table: TableId) -> BTreeSet<RowId> {
        self.inner
            .lock()
            .locks
            .shared_rows
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    /// Rows of `table` held in exclusive mode (empty if none).
    #[must_use]
    pub fn exclusive_row_locks(&self, table: TableId) -> BTreeSet<RowId> {
        self.inner
            .lock()
            .locks
            .exclusive_rows
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    /// The mode held on `resource`, table or row.
    #[must_use]
    pub fn held_mode(&self, resource: ResourceId) -> Option<LockMode> {
        let inner = self.inner.lock();
        match resource {
            ResourceId::Table(table) => inner.locks.table_mode(table),
            ResourceId::Row(table, row) => inner.locks.row_mode(table, row),
        }
    }

    #[must_use]
    pub fn is_row_shared_locked(&self, table: TableId, row: RowId) -> bool {
        self.inner.lock().locks.row_mode(table, row) == Some(LockMode::Shared)
    }

    #[must_use]
    pub fn is_row_exclusive_locked(&self, table: TableId, row: RowId) -> bool {
        self.inner.lock().locks.row_mode(table, row) == Some(LockMode::Exclusive)
    }

    /// `(S, X, IS, IX, SIX)` table lock set sizes.
    #[must_use]
    pub fn lock_counts(&self) -> TableLockCounts {
        self.inner.lock().locks.counts()
    }

    /// Whether any table or row lock is still recorded.
    #[must_use]
    pub fn holds_any_lock(&self) -> bool {
        !self.inner.lock().locks.is_empty()
    }

    /// The resource this transaction is blocked on, if any.
    #[must_use]
    pub fn waiting_on(&self) -> Option<ResourceId> {
        self.inner.lock().waiting_on
    }

    // -- crate-internal mutation ------------------------------------------

    pub(crate) fn holds_row_locks_on(&self, table: TableId) -> bool {
        self.inner.lock().locks.has_rows_on(table)
    }

    pub(crate) fn held_locks(&self) -> HeldLocks {
        self.inner.lock().locks.held()
    }

    pub(crate) fn remove_lock(&self, resource: ResourceId) -> Option<LockMode> {
        self.inner.lock().locks.remove(resource)
    }

    /// Record a granted lock and leave the waiting state in one step, so an
    /// aborter sees either the pending wait or the held lock.
    pub(crate) fn finish_grant(&self, resource: ResourceId, mode: LockMode) {
        let mut inner = self.inner.lock();
        inner.locks.insert(resource, mode);
        inner.waiting_on = None;
    }

    /// Register a wait on `resource` unless the transaction is already
    /// aborted. Returns `false` if it is.
    pub(crate) fn register_wait(&self, resource: ResourceId) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == TransactionState::Aborted {
            return false;
        }
        inner.waiting_on = Some(resource);
        true
    }

    pub(crate) fn clear_wait(&self) {
        self.inner.lock().waiting_on = None;
    }

    /// Enter SHRINKING if still GROWING.
    pub(crate) fn begin_shrinking(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == TransactionState::Growing {
            inner.state = TransactionState::Shrinking;
            true
        } else {
            false
        }
    }

    /// Move to ABORTED and report what the transaction was blocked on.
    /// A committed transaction stays committed.
    pub(crate) fn mark_aborted(&self) -> Option<ResourceId> {
        let mut inner = self.inner.lock();
        if inner.state != TransactionState::Committed {
            inner.state = TransactionState::Aborted;
        }
        inner.waiting_on
    }

    pub(crate) fn mark_committed(&self) {
        self.inner.lock().state = TransactionState::Committed;
    }

    /// Start a new logical transaction on this handle.
    pub(crate) fn reset(&self, id: TxnId, isolation_level: IsolationLevel) {
        let mut inner = self.inner.lock();
        self.id.store(id.get(), Ordering::Release);
        inner.state = TransactionState::Growing;
        inner.isolation_level = isolation_level;
        inner.locks = LockSets::default();
        inner.waiting_on = None;
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("state", &inner.state)
            .field("isolation_level", &inner.isolation_level)
            .field("table_locks", &inner.locks.counts())
            .field("waiting_on", &inner.waiting_on)
            .finish()
    }
}
