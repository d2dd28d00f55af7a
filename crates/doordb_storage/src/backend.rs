//! Connection and datasource trait definitions.

use crate::error::StorageResult;
use crate::table::{Row, RowChange, RowKey, TableDef};
use crate::trigger::TriggerDef;
use std::fmt;

/// Concurrency model of the underlying engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// One writer at a time (SQLite-like). No notification channels.
    SingleWriter,
    /// Concurrent writers (Postgres-like). Supports `LISTEN`/`NOTIFY`.
    MultiWriter,
}

impl Dialect {
    /// Human-readable dialect name.
    pub fn name(self) -> &'static str {
        match self {
            Dialect::SingleWriter => "single-writer",
            Dialect::MultiWriter => "multi-writer",
        }
    }

    /// Returns true if the dialect can deliver notifications.
    pub fn supports_notify(self) -> bool {
        matches!(self, Dialect::MultiWriter)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A notification delivered to listeners after the sending transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Channel name.
    pub channel: String,
    /// Payload (the changed table's name for invalidation triggers).
    pub payload: String,
}

/// Receiving end of a `LISTEN`. Yields `None` once the listener connection is lost.
pub type NotificationReceiver = tokio::sync::mpsc::UnboundedReceiver<Notification>;

/// A single database connection.
///
/// Connections are not shared: the transaction coordinator hands one
/// connection to exactly one transaction at a time.
///
/// # Invariants
///
/// - Writes outside `begin`/`commit` autocommit individually
/// - Changes made inside a transaction are invisible to other connections
///   until `commit` returns
/// - Notifications raised inside a transaction are delivered only after commit
/// - Temporary triggers are dropped when the transaction ends
pub trait Connection: Send {
    /// Connection identifier, unique per datasource.
    fn id(&self) -> u64;

    /// The engine's dialect.
    fn dialect(&self) -> Dialect;

    /// Begins a transaction (disables autocommit).
    ///
    /// # Errors
    ///
    /// Returns `TransactionActive` if a transaction is already open.
    fn begin(&mut self) -> StorageResult<()>;

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns `NoTransaction` if none is open.
    fn commit(&mut self) -> StorageResult<()>;

    /// Rolls back the open transaction, discarding its writes.
    ///
    /// # Errors
    ///
    /// Returns `NoTransaction` if none is open.
    fn rollback(&mut self) -> StorageResult<()>;

    /// Returns true if a transaction is open.
    fn in_transaction(&self) -> bool;

    /// Creates a table if it does not exist yet.
    fn create_table(&mut self, table: &TableDef) -> StorageResult<()>;

    /// Installs a trigger unless one with the same name exists.
    ///
    /// Returns true if the trigger was newly installed.
    fn install_trigger(&mut self, trigger: &TriggerDef) -> StorageResult<bool>;

    /// Inserts a row, failing on a duplicate key.
    fn insert(&mut self, table: &str, row: Row) -> StorageResult<RowKey>;

    /// Inserts or replaces a row.
    fn upsert(&mut self, table: &str, row: Row) -> StorageResult<RowKey>;

    /// Replaces the row at `key` only if it exists and every field of
    /// `expected` has the given value. Returns true if the row was written.
    ///
    /// SQL drivers render this as `UPDATE .. SET .. WHERE pk = ? AND f = ?`:
    /// the condition is evaluated against the row as it is when the write
    /// takes effect, so a concurrent commit that changed one of the expected
    /// fields makes the update a no-op instead of being overwritten.
    fn update_if(&mut self, table: &str, key: RowKey, expected: &Row, row: Row)
        -> StorageResult<bool>;

    /// Deletes a row. Returns true if it existed.
    fn delete(&mut self, table: &str, key: RowKey) -> StorageResult<bool>;

    /// Reads one row, seeing this connection's uncommitted writes.
    fn get(&self, table: &str, key: RowKey) -> StorageResult<Option<Row>>;

    /// Returns all rows matching `filter`, ordered by key.
    fn scan(&self, table: &str, filter: &dyn Fn(&Row) -> bool)
        -> StorageResult<Vec<(RowKey, Row)>>;

    /// Row changes made by statements of the open transaction, in order.
    ///
    /// Writes performed by trigger actions are not included.
    fn pending_changes(&self) -> &[RowChange];
}

/// A source of connections to one database.
pub trait DataSource: Send + Sync {
    /// The engine's dialect.
    fn dialect(&self) -> Dialect;

    /// Opens a new connection.
    fn connect(&self) -> StorageResult<Box<dyn Connection>>;

    /// Opens a dedicated listener on `channel`.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` on dialects without notifications.
    fn listen(&self, channel: &str) -> StorageResult<NotificationReceiver>;
}
