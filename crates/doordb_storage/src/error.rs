//! Error types for storage operations.

use crate::table::RowKey;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The referenced table does not exist.
    #[error("no such table: {0}")]
    NoSuchTable(String),

    /// A row with the same key already exists.
    #[error("duplicate key {key} in table {table}")]
    DuplicateKey {
        /// Table name.
        table: String,
        /// The conflicting key.
        key: RowKey,
    },

    /// A row is missing one of its key fields, or the field is not an integer.
    #[error("row for table {table} has no integer key field {field}")]
    MissingKey {
        /// Table name.
        table: String,
        /// Name of the key field.
        field: String,
    },

    /// A conditional update tried to move a row to another key.
    #[error("update of {key} in table {table} changes its key")]
    KeyChanged {
        /// Table name.
        table: String,
        /// Key of the row being updated.
        key: RowKey,
    },

    /// An operation required an open transaction.
    #[error("no transaction is active")]
    NoTransaction,

    /// `begin` was called while a transaction was already open.
    #[error("a transaction is already active on this connection")]
    TransactionActive,

    /// A trigger could not be installed.
    #[error("trigger {name} could not be installed: {reason}")]
    TriggerInstall {
        /// Trigger name.
        name: String,
        /// Why installation failed.
        reason: String,
    },

    /// The dialect does not support the requested feature.
    #[error("not supported by the {dialect} dialect: {feature}")]
    Unsupported {
        /// Dialect name.
        dialect: &'static str,
        /// The unsupported feature.
        feature: String,
    },

    /// The connection is closed.
    #[error("connection is closed")]
    Closed,

    /// Driver-level failure.
    #[error("driver error: {0}")]
    Driver(String),
}

impl StorageError {
    /// Creates a trigger installation error.
    pub fn trigger_install(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TriggerInstall {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if retrying the operation on a fresh connection may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Closed | StorageError::Driver(_))
    }
}
