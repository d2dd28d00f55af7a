//! Table definitions, row keys and row change records.

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A row: field name to JSON value.
pub type Row = serde_json::Map<String, Value>;

/// Composite integer key of a row.
///
/// Single-column keys leave `key2` at zero.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RowKey {
    /// First key column.
    pub key1: i64,
    /// Second key column, zero when unused.
    pub key2: i64,
}

impl RowKey {
    /// Creates a two-column key.
    #[must_use]
    pub const fn new(key1: i64, key2: i64) -> Self {
        Self { key1, key2 }
    }

    /// Creates a single-column key.
    #[must_use]
    pub const fn single(key1: i64) -> Self {
        Self { key1, key2: 0 }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key2 == 0 {
            write!(f, "{}", self.key1)
        } else {
            write!(f, "({}, {})", self.key1, self.key2)
        }
    }
}

/// Definition of a keyed table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Name of the first key column.
    pub key1: String,
    /// Name of the optional second key column.
    pub key2: Option<String>,
}

impl TableDef {
    /// Creates a table keyed by a single integer column.
    pub fn new(name: impl Into<String>, key1: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key1: key1.into(),
            key2: None,
        }
    }

    /// Adds a second key column.
    #[must_use]
    pub fn with_key2(mut self, key2: impl Into<String>) -> Self {
        self.key2 = Some(key2.into());
        self
    }

    /// Extracts the key of `row`.
    ///
    /// # Errors
    ///
    /// Returns `MissingKey` if a key field is absent or not an integer.
    pub fn key_of(&self, row: &Row) -> StorageResult<RowKey> {
        let key1 = self.read_key(row, &self.key1)?;
        let key2 = match &self.key2 {
            Some(field) => self.read_key(row, field)?,
            None => 0,
        };
        Ok(RowKey::new(key1, key2))
    }

    fn read_key(&self, row: &Row, field: &str) -> StorageResult<i64> {
        row.get(field)
            .and_then(Value::as_i64)
            .ok_or_else(|| StorageError::MissingKey {
                table: self.name.clone(),
                field: field.to_string(),
            })
    }

    /// Renders `CREATE TABLE IF NOT EXISTS` for the key columns.
    ///
    /// Non-key columns belong to the schema generator; this covers the
    /// system tables the replication core owns.
    pub fn create_sql(&self) -> String {
        match &self.key2 {
            Some(key2) => format!(
                "CREATE TABLE IF NOT EXISTS {} ({} BIGINT NOT NULL, {} BIGINT NOT NULL, PRIMARY KEY ({}, {}))",
                self.name, self.key1, key2, self.key1, key2
            ),
            None => format!(
                "CREATE TABLE IF NOT EXISTS {} ({} BIGINT PRIMARY KEY NOT NULL)",
                self.name, self.key1
            ),
        }
    }
}

/// Kind of a row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Row was inserted.
    Insert,
    /// Row existed and was replaced.
    Update,
    /// Row was deleted.
    Delete,
}

/// A row-level change made by the current transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    /// Table name.
    pub table: String,
    /// Key of the changed row.
    pub key: RowKey,
    /// What happened to the row.
    pub kind: ChangeKind,
}
