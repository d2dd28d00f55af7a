//! The explicit transaction handle.

use crate::error::{CoreError, CoreResult};
use crate::pool::PooledConnection;
use crate::types::{NodeId, TransactionId, TransactionMode};
use doordb_storage::{Connection, Row, RowChange, RowKey, StorageResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

pub(crate) type Deferred = Box<dyn FnOnce() + Send>;

struct Inner {
    id: TransactionId,
    mode: TransactionMode,
    conn: Mutex<Option<PooledConnection>>,
    received: Mutex<HashMap<(String, RowKey), NodeId>>,
    deferred: Mutex<Vec<Deferred>>,
}

/// Handle to an open transaction.
///
/// The handle is threaded explicitly through every call that should take
/// part in the transaction. Clones refer to the same transaction and the
/// same connection. Once the coordinator closes the transaction (commit,
/// rollback, timeout or shutdown) every operation fails with
/// [`CoreError::Closed`].
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("mode", &self.inner.mode)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, mode: TransactionMode, conn: PooledConnection) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                mode,
                conn: Mutex::new(Some(conn)),
                received: Mutex::new(HashMap::new()),
                deferred: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Transaction id.
    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// Access mode.
    pub fn mode(&self) -> TransactionMode {
        self.inner.mode
    }

    /// Returns true until the coordinator closes the transaction.
    pub fn is_open(&self) -> bool {
        self.inner.conn.lock().is_some()
    }

    /// Runs `f` on the transaction's connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut dyn Connection) -> StorageResult<T>,
    ) -> CoreResult<T> {
        let mut guard = self.inner.conn.lock();
        let conn = guard.as_mut().ok_or(CoreError::Closed)?;
        Ok(f(&mut **conn)?)
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut dyn Connection) -> StorageResult<T>,
    ) -> CoreResult<T> {
        if !self.inner.mode.is_write() {
            return Err(CoreError::invalid_operation(format!(
                "write attempted in read-only transaction {}",
                self.inner.id
            )));
        }
        self.with_conn(f)
    }

    /// Inserts a row, failing on a duplicate key.
    pub fn insert(&self, table: &str, row: Row) -> CoreResult<RowKey> {
        self.write(|conn| conn.insert(table, row))
    }

    /// Inserts or replaces a row.
    pub fn upsert(&self, table: &str, row: Row) -> CoreResult<RowKey> {
        self.write(|conn| conn.upsert(table, row))
    }

    /// Replaces the row at `key` only if every field of `expected` still
    /// holds when the write takes effect. Returns true if it was written.
    pub fn update_if(&self, table: &str, key: RowKey, expected: &Row, row: Row) -> CoreResult<bool> {
        self.write(|conn| conn.update_if(table, key, expected, row))
    }

    /// Deletes a row. Returns true if it existed.
    pub fn delete(&self, table: &str, key: RowKey) -> CoreResult<bool> {
        self.write(|conn| conn.delete(table, key))
    }

    /// Reads a row, seeing this transaction's own writes.
    pub fn get(&self, table: &str, key: RowKey) -> CoreResult<Option<Row>> {
        self.with_conn(|conn| conn.get(table, key))
    }

    /// Returns the rows of `table` matching `filter`, in key order.
    pub fn scan(
        &self,
        table: &str,
        filter: impl Fn(&Row) -> bool,
    ) -> CoreResult<Vec<(RowKey, Row)>> {
        self.with_conn(|conn| conn.scan(table, &filter))
    }

    /// Row changes made so far by this transaction.
    pub fn changes(&self) -> CoreResult<Vec<RowChange>> {
        self.with_conn(|conn| Ok(conn.pending_changes().to_vec()))
    }

    /// Records that the row at `key` was written with content received
    /// from `node`.
    pub(crate) fn record_origin(&self, table: &str, key: RowKey, node: NodeId) {
        self.inner
            .received
            .lock()
            .insert((table.to_string(), key), node);
    }

    /// Node the current content of `key` was received from, if any.
    ///
    /// A later local write of the same row in this transaction does not
    /// clear it.
    pub fn origin_of(&self, table: &str, key: RowKey) -> Option<NodeId> {
        self.inner
            .received
            .lock()
            .get(&(table.to_string(), key))
            .copied()
    }

    /// Runs `f` once the outermost transaction has committed. Dropped on
    /// rollback.
    pub(crate) fn defer(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.deferred.lock().push(Box::new(f));
    }

    pub(crate) fn take_deferred(&self) -> Vec<Deferred> {
        std::mem::take(&mut *self.inner.deferred.lock())
    }

    /// Runs `block` inside this transaction.
    ///
    /// No new connection is acquired and nothing is committed here; the
    /// outermost coordinator call commits or rolls back.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidOperation` when a read-write block is nested in a
    /// read-only transaction.
    pub async fn with_transaction<R, E, F, Fut>(
        &self,
        mode: TransactionMode,
        block: F,
    ) -> Result<R, E>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<CoreError>,
    {
        if mode.is_write() && !self.inner.mode.is_write() {
            return Err(CoreError::invalid_operation(
                "read-write block nested in a read-only transaction",
            )
            .into());
        }
        if !self.is_open() {
            return Err(CoreError::Closed.into());
        }
        block(self.clone()).await
    }

    /// Closes the transaction, rolling back if still open.
    ///
    /// Returns false if it was already closed. The connection goes back to
    /// the pool when the returned handle drops, which happens here.
    pub(crate) fn close(&self) -> bool {
        let Some(mut conn) = self.inner.conn.lock().take() else {
            return false;
        };
        if conn.in_transaction() {
            match conn.rollback() {
                Ok(()) => tracing::debug!(txn = %self.inner.id, "rolled back"),
                Err(err) => {
                    tracing::error!(txn = %self.inner.id, error = %err, "rollback failed")
                }
            }
        }
        true
    }
}
