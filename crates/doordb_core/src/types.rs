//! Core identifiers and small value types.

use std::fmt;

pub use doordb_sync_protocol::{NodeId, TableId, Version};

/// Identifier of a top-level transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Returns the raw id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// Access mode of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Reads only. Writes fail and no change tracking is installed.
    ReadOnly,
    /// Reads and writes.
    ReadWrite,
}

impl TransactionMode {
    /// Returns true for [`TransactionMode::ReadWrite`].
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, TransactionMode::ReadWrite)
    }
}
