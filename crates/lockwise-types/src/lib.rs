//! Foundation types for the lockwise concurrency core.
//!
//! Identifiers ([`TxnId`], [`TableId`], [`RowId`], [`ResourceId`]) and the
//! lock vocabulary ([`LockMode`], [`IsolationLevel`], [`TransactionState`])
//! live here so that the error, observability and lock-manager crates can
//! share them without depending on each other.

pub mod lock_mode;

pub use lock_mode::{IsolationLevel, LockMode, TransactionState};

use std::fmt;

// ---------------------------------------------------------------------------
// TxnId
// ---------------------------------------------------------------------------

/// Transaction identifier.
///
/// Allocated monotonically by the transaction manager starting at 0. Larger
/// ids belong to younger transactions, which is what the deadlock detector
/// relies on when picking a victim.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TxnId(u64);

impl TxnId {
    /// The first id handed out by a fresh transaction manager.
    pub const FIRST: Self = Self(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

impl From<u64> for TxnId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

// ---------------------------------------------------------------------------
// TableId
// ---------------------------------------------------------------------------

/// Identifier for a table (catalog object id).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TableId(u32);

impl TableId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table#{}", self.0)
    }
}

impl From<u32> for TableId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

// ---------------------------------------------------------------------------
// RowId
// ---------------------------------------------------------------------------

/// Physical row locator: the page holding the tuple and its slot.
///
/// The lock manager never interprets the fields; it only needs equality,
/// ordering and hashing for set membership.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct RowId {
    page_id: i32,
    slot: u32,
}

impl RowId {
    #[inline]
    pub const fn new(page_id: i32, slot: u32) -> Self {
        Self { page_id, slot }
    }

    #[inline]
    pub const fn page_id(self) -> i32 {
        self.page_id
    }

    #[inline]
    pub const fn slot(self) -> u32 {
        self.slot
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot)
    }
}

// ---------------------------------------------------------------------------
// ResourceId
// ---------------------------------------------------------------------------

/// The unit a lock protects: a whole table or a single row of a table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum ResourceId {
    Table(TableId),
    Row(TableId, RowId),
}

impl ResourceId {
    /// The table this resource belongs to (itself for table resources).
    #[inline]
    pub const fn table(self) -> TableId {
        match self {
            Self::Table(table) | Self::Row(table, _) => table,
        }
    }

    #[inline]
    pub const fn is_row(self) -> bool {
        matches!(self, Self::Row(..))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table(table) => write!(f, "{table}"),
            Self::Row(table, row) => write!(f, "{table} row {row}"),
        }
    }
}

impl From<TableId> for ResourceId {
    fn from(table: TableId) -> Self {
        Self::Table(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn txn_id_display_and_order() {
        let a = TxnId::new(3);
        let b = TxnId::new(7);
        assert!(a < b);
        assert_eq!(a.to_string(), "txn#3");
        assert_eq!(TxnId::FIRST.get(), 0);
    }

    #[test]
    fn row_id_orders_by_page_then_slot() {
        let rows: BTreeSet<RowId> = [RowId::new(1, 0), RowId::new(0, 9), RowId::new(0, 1)]
            .into_iter()
            .collect();
        let ordered: Vec<_> = rows.into_iter().collect();
        assert_eq!(
            ordered,
            vec![RowId::new(0, 1), RowId::new(0, 9), RowId::new(1, 0)]
        );
    }

    #[test]
    fn resource_table_projection() {
        let table = TableId::new(4);
        assert_eq!(ResourceId::Table(table).table(), table);
        assert_eq!(ResourceId::Row(table, RowId::new(2, 2)).table(), table);
        assert!(ResourceId::Row(table, RowId::default()).is_row());
        assert!(!ResourceId::from(table).is_row());
    }

    #[test]
    fn resource_display() {
        let res = ResourceId::Row(TableId::new(0), RowId::new(0, 5));
        assert_eq!(res.to_string(), "table#0 row (0, 5)");
    }

    #[test]
    fn resource_serde_shape() {
        let res = ResourceId::Row(TableId::new(1), RowId::new(2, 3));
        let json = serde_json::to_string(&res).unwrap();
        let back: ResourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, res);
    }
}
