//! Transaction coordinator.

use super::handle::Deferred;
use super::Transaction;
use crate::change_tracker::ChangeTracker;
use crate::error::{CoreError, CoreResult};
use crate::pool::ConnectionPool;
use crate::subscription::{Registry, Subscription};
use crate::types::{TransactionId, TransactionMode};
use doordb_storage::Dialect;
use doordb_sync_protocol::NodeEvent;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Work done inside a transaction right before it commits.
///
/// Hooks run in registration order on the transaction's connection. An
/// error aborts the commit and rolls the transaction back.
pub trait CommitHook: Send + Sync {
    /// Returns the replication events produced by the transaction.
    fn before_commit(&self, txn: &Transaction) -> CoreResult<Vec<NodeEvent>>;
}

/// Summary of a committed read-write transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// The committed transaction.
    pub transaction_id: u64,
    /// Tables with row changes made by the transaction's statements.
    pub changed_tables: BTreeSet<String>,
    /// Replication events, deduplicated, in emission order.
    pub node_events: Vec<NodeEvent>,
}

type CommitCallback = Arc<dyn Fn(&CommitReport) + Send + Sync>;

static NEXT_COORDINATOR: AtomicU64 = AtomicU64::new(1);

/// Transaction whose block is running on the current task.
#[derive(Clone)]
struct Ambient {
    coordinator: u64,
    txn: Transaction,
}

tokio::task_local! {
    static AMBIENT: Ambient;
}

/// Removes a transaction from the open set and closes it, however the
/// coordinator call ends (including cancellation of the caller).
struct OpenGuard<'a> {
    open: &'a Mutex<HashMap<TransactionId, Transaction>>,
    txn: Transaction,
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        self.open.lock().remove(&self.txn.id());
        self.txn.close();
    }
}

/// Runs transaction blocks with change tracking and replication hooks.
///
/// Pipeline for a top-level call:
///
/// 1. single-writer engines: take the process-wide writer lock
/// 2. acquire a pooled connection and `BEGIN`
/// 3. install change tracking (read-write only)
/// 4. run the block under the transaction timeout
/// 5. run commit hooks, read and clear dirty bits, `COMMIT`
/// 6. release the connection, then notify observers and commit listeners
///
/// Any error rolls back and propagates unchanged; the connection is
/// released exactly once on every path.
pub struct TransactionCoordinator {
    instance: u64,
    dialect: Dialect,
    pool: Arc<ConnectionPool>,
    writer: Arc<tokio::sync::Mutex<()>>,
    change_tracker: Arc<ChangeTracker>,
    hooks: RwLock<Vec<Arc<dyn CommitHook>>>,
    commit_listeners: Arc<Registry<CommitCallback>>,
    open: Mutex<HashMap<TransactionId, Transaction>>,
    next_id: AtomicU64,
    timeout: Option<Duration>,
    closed: AtomicBool,
}

impl TransactionCoordinator {
    /// Creates a coordinator.
    pub fn new(
        dialect: Dialect,
        pool: Arc<ConnectionPool>,
        change_tracker: Arc<ChangeTracker>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            instance: NEXT_COORDINATOR.fetch_add(1, Ordering::Relaxed),
            dialect,
            pool,
            writer: Arc::new(tokio::sync::Mutex::new(())),
            change_tracker,
            hooks: RwLock::new(Vec::new()),
            commit_listeners: Registry::new(),
            open: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Adds a pre-commit hook.
    pub fn add_hook(&self, hook: Arc<dyn CommitHook>) {
        self.hooks.write().push(hook);
    }

    /// Registers a callback run after every read-write commit.
    pub fn on_commit(&self, callback: impl Fn(&CommitReport) + Send + Sync + 'static) -> Subscription {
        self.commit_listeners.add(Arc::new(callback))
    }

    /// The change tracker used by this coordinator.
    pub fn change_tracker(&self) -> &Arc<ChangeTracker> {
        &self.change_tracker
    }

    /// The connection pool.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Ids of transactions currently open.
    pub fn open_transactions(&self) -> Vec<TransactionId> {
        let mut ids: Vec<TransactionId> = self.open.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Runs `block` in a transaction.
    ///
    /// Called from inside another block of this coordinator on the same
    /// task, `block` joins that open transaction (as
    /// [`Transaction::with_transaction`] does) instead of waiting for a
    /// second connection or the writer lock the outer block holds. Blocks
    /// on spawned tasks start their own transactions.
    ///
    /// # Errors
    ///
    /// Returns the block's error, or a coordinator error converted into `E`:
    /// `Connection`, `TransactionTimeout`, `TriggerSetup`, `Closed`, or a
    /// storage error from `BEGIN`/`COMMIT`.
    pub async fn with_transaction<R, E, F, Fut>(&self, mode: TransactionMode, block: F) -> Result<R, E>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<CoreError>,
    {
        if let Some(outer) = self.ambient() {
            tracing::trace!(txn = %outer.id(), ?mode, "joining open transaction");
            return outer.with_transaction(mode, block).await;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Closed.into());
        }

        let _writer = match self.dialect {
            Dialect::SingleWriter => Some(Arc::clone(&self.writer).lock_owned().await),
            Dialect::MultiWriter => None,
        };
        // Re-check: close() may have run while we waited for the lock.
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Closed.into());
        }

        let conn = self.pool.acquire().await?;
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let txn = Transaction::new(id, mode, conn);
        self.open.lock().insert(id, txn.clone());
        let guard = OpenGuard {
            open: &self.open,
            txn,
        };
        tracing::debug!(txn = %id, ?mode, "transaction started");

        let result = self.run(&guard.txn, block).await;
        drop(guard);

        let (value, committed, deferred) = result?;
        if let Some((report, invalidated)) = committed {
            self.after_commit(&report, &invalidated);
        }
        for f in deferred {
            f();
        }
        Ok(value)
    }

    fn ambient(&self) -> Option<Transaction> {
        AMBIENT
            .try_with(|ambient| {
                (ambient.coordinator == self.instance && ambient.txn.is_open())
                    .then(|| ambient.txn.clone())
            })
            .ok()
            .flatten()
    }

    async fn run<R, E, F, Fut>(
        &self,
        txn: &Transaction,
        block: F,
    ) -> Result<(R, Option<(CommitReport, BTreeSet<String>)>, Vec<Deferred>), E>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<CoreError>,
    {
        txn.with_conn(|conn| conn.begin())?;
        let write = txn.mode().is_write();
        if write {
            self.change_tracker.before_block(txn)?;
        }

        let ambient = Ambient {
            coordinator: self.instance,
            txn: txn.clone(),
        };
        let scoped = AMBIENT.scope(ambient, block(txn.clone()));
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, scoped).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(txn = %txn.id(), timeout = ?limit, "transaction timed out");
                    return Err(CoreError::TransactionTimeout {
                        transaction_id: txn.id().as_u64(),
                        timeout: limit,
                    }
                    .into());
                }
            },
            None => scoped.await,
        };
        let value = outcome?;

        if !write {
            txn.with_conn(|conn| conn.commit())?;
            return Ok((value, None, txn.take_deferred()));
        }

        let (report, invalidated) = self.prepare_commit(txn)?;
        txn.with_conn(|conn| conn.commit())?;
        tracing::debug!(
            txn = %txn.id(),
            tables = report.changed_tables.len(),
            events = report.node_events.len(),
            "transaction committed"
        );
        Ok((value, Some((report, invalidated)), txn.take_deferred()))
    }

    fn prepare_commit(&self, txn: &Transaction) -> CoreResult<(CommitReport, BTreeSet<String>)> {
        let changed_tables = txn.changes()?.into_iter().map(|c| c.table).collect();
        let mut node_events: Vec<NodeEvent> = Vec::new();
        let hooks = self.hooks.read().clone();
        for hook in hooks {
            for event in hook.before_commit(txn)? {
                if !node_events.contains(&event) {
                    node_events.push(event);
                }
            }
        }
        let invalidated = self.change_tracker.before_commit(txn)?;
        let report = CommitReport {
            transaction_id: txn.id().as_u64(),
            changed_tables,
            node_events,
        };
        Ok((report, invalidated))
    }

    fn after_commit(&self, report: &CommitReport, invalidated: &BTreeSet<String>) {
        // Multi-writer invalidations arrive through the listener instead.
        self.change_tracker.dispatch(invalidated);
        for listener in self.commit_listeners.snapshot() {
            listener(report);
        }
    }

    /// Closes the coordinator.
    ///
    /// New transactions fail with `Closed`. Transactions still open are
    /// force-closed (rolled back) and reported as leaks. Returns the number
    /// of leaked transactions.
    pub fn close(&self) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let leaked: Vec<Transaction> = self.open.lock().drain().map(|(_, txn)| txn).collect();
        for txn in &leaked {
            tracing::warn!(txn = %txn.id(), "transaction still open at shutdown, rolling back");
            txn.close();
        }
        self.pool.close();
        self.change_tracker.shutdown();
        leaked.len()
    }

    /// Returns true once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
