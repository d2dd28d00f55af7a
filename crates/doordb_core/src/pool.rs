//! Bounded connection pool.

use crate::error::{CoreError, CoreResult};
use doordb_storage::{Connection, DataSource};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A pool of at most `size` connections.
///
/// Acquisition suspends until a connection is free or the acquire timeout
/// elapses. Idle connections are reused; a connection is returned to the
/// pool when its [`PooledConnection`] drops.
pub struct ConnectionPool {
    source: Arc<dyn DataSource>,
    idle: Mutex<Vec<Box<dyn Connection>>>,
    permits: Arc<Semaphore>,
    size: usize,
    acquire_timeout: Duration,
}

impl ConnectionPool {
    /// Creates a pool over `source`.
    pub fn new(source: Arc<dyn DataSource>, size: usize, acquire_timeout: Duration) -> Arc<Self> {
        let size = size.max(1);
        Arc::new(Self {
            source,
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(size)),
            size,
            acquire_timeout,
        })
    }

    /// Acquires a connection.
    ///
    /// # Errors
    ///
    /// - `Connection` if the timeout elapses or the datasource fails to connect
    /// - `Closed` if the pool has been closed
    pub async fn acquire(self: &Arc<Self>) -> CoreResult<PooledConnection> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| {
            CoreError::connection(format!(
                "no connection available after {:?}",
                self.acquire_timeout
            ))
        })?
        .map_err(|_| CoreError::Closed)?;

        let reused = self.idle.lock().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => self
                .source
                .connect()
                .map_err(|e| CoreError::connection(e.to_string()))?,
        };
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Maximum number of connections.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Connections not currently handed out.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Closes the pool: pending and future acquisitions fail.
    pub fn close(&self) {
        self.permits.close();
        self.idle.lock().clear();
    }

    fn release(&self, mut conn: Box<dyn Connection>) {
        if conn.in_transaction() {
            if let Err(err) = conn.rollback() {
                tracing::error!(connection = conn.id(), error = %err, "rollback on release failed");
                return;
            }
        }
        if !self.permits.is_closed() {
            self.idle.lock().push(conn);
        }
    }
}

/// A connection checked out of a [`ConnectionPool`].
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        // Only `drop` takes the connection out.
        match &self.conn {
            Some(conn) => conn.as_ref(),
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn.as_mut(),
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
