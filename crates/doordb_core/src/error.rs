//! Error types for the replication core.

use doordb_sync_protocol::{NodeId, TableId};
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in replication core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A connection could not be obtained or was lost.
    #[error("connection error: {message}")]
    Connection {
        /// Description of the failure.
        message: String,
    },

    /// The transaction block did not finish in time and was cancelled.
    #[error("transaction {transaction_id} timed out after {timeout:?}")]
    TransactionTimeout {
        /// The cancelled transaction.
        transaction_id: u64,
        /// The configured limit.
        timeout: Duration,
    },

    /// Change tracking triggers could not be installed.
    #[error("trigger setup failed: {message}")]
    TriggerSetup {
        /// Description of the failure.
        message: String,
    },

    /// The node's credentials were rejected.
    #[error("authentication rejected for node {node_id}")]
    AuthRejected {
        /// The rejected node.
        node_id: NodeId,
    },

    /// The configured node id does not match the one stored in the database.
    #[error("node id mismatch: database belongs to node {stored}, configured {configured}")]
    NodeIdMismatch {
        /// Id persisted in the database.
        stored: NodeId,
        /// Id from the configuration.
        configured: NodeId,
    },

    /// The node's key partition for a table has no keys left.
    #[error("primary keys exhausted for table {table_id}")]
    PrimaryKeyExhausted {
        /// The exhausted table.
        table_id: TableId,
    },

    /// The table id is not registered as replicable.
    #[error("unknown table id {0}")]
    UnknownTable(TableId),

    /// An entity row is missing its key or version.
    #[error("invalid entity for {table}: {message}")]
    InvalidEntity {
        /// Table name.
        table: String,
        /// What is wrong.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Why the operation is invalid.
        message: String,
    },

    /// The database, transaction or manager has been closed.
    #[error("closed")]
    Closed,

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] doordb_storage::StorageError),
}

impl CoreError {
    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a trigger setup error.
    pub fn trigger_setup(message: impl Into<String>) -> Self {
        Self::TriggerSetup {
            message: message.into(),
        }
    }

    /// Creates an invalid entity error.
    pub fn invalid_entity(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidEntity {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if the caller may retry the whole operation.
    ///
    /// Connection failures and timeouts are retryable by policy; trigger
    /// setup failures and authentication rejections are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Connection { .. } | CoreError::TransactionTimeout { .. } => true,
            CoreError::Storage(err) => err.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doordb_storage::StorageError;

    #[test]
    fn retryable_vs_terminal() {
        assert!(CoreError::connection("pool exhausted").is_retryable());
        assert!(CoreError::TransactionTimeout {
            transaction_id: 1,
            timeout: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(CoreError::from(StorageError::Closed).is_retryable());
        assert!(!CoreError::trigger_setup("boom").is_retryable());
        assert!(!CoreError::AuthRejected { node_id: 3 }.is_retryable());
        assert!(!CoreError::Closed.is_retryable());
    }
}
