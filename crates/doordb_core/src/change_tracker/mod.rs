//! Invalidation tracking.
//!
//! Detects which tables a committed transaction changed and tells observers
//! about it, after commit only.
//!
//! - Single-writer engines get temporary per-table triggers installed at the
//!   start of every read-write transaction. The triggers set a dirty bit in
//!   [`INVALIDATIONS_TABLE`](crate::system::INVALIDATIONS_TABLE); the bits are
//!   read and cleared just before commit and dispatched right after it.
//! - Multi-writer engines get persistent statement-level triggers that
//!   `NOTIFY` one shared channel with the table name. A background listener
//!   fans notifications out to observers, and restarts with backoff when the
//!   listening connection is lost.

mod listener;

use crate::error::{CoreError, CoreResult};
use crate::subscription::{Registry, Subscription};
use crate::system;
use crate::transaction::Transaction;
use crate::types::TableId;
use doordb_storage::{Connection, Dialect, TriggerAction, TriggerDef, TriggerEvent, TriggerScope};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type ObserverCallback = Arc<dyn Fn(&BTreeSet<String>) + Send + Sync>;

#[derive(Clone)]
struct Observer {
    tables: Arc<BTreeSet<String>>,
    callback: ObserverCallback,
}

/// Tracks table invalidations and dispatches them to observers.
pub struct ChangeTracker {
    dialect: Dialect,
    watched: Vec<(TableId, String)>,
    channel: String,
    observers: Arc<Registry<Observer>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeTracker {
    /// Creates a tracker for the given `(table id, table name)` pairs.
    pub fn new(dialect: Dialect, watched: Vec<(TableId, String)>, channel: impl Into<String>) -> Self {
        Self {
            dialect,
            watched,
            channel: channel.into(),
            observers: Registry::new(),
            listener: Mutex::new(None),
        }
    }

    /// Registers `callback` for changes to any of `tables`.
    ///
    /// The callback receives the intersection of its interest set with the
    /// tables a commit changed, and is never called with an empty set.
    pub fn observe<I, S>(
        &self,
        tables: I,
        callback: impl Fn(&BTreeSet<String>) + Send + Sync + 'static,
    ) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.observers.add(Observer {
            tables: Arc::new(tables.into_iter().map(Into::into).collect()),
            callback: Arc::new(callback),
        })
    }

    /// Like [`observe`](Self::observe), delivering into a channel.
    pub fn observe_channel<I, S>(
        &self,
        tables: I,
    ) -> (Subscription, mpsc::UnboundedReceiver<BTreeSet<String>>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.observe(tables, move |changed| {
            let _ = tx.send(changed.clone());
        });
        (subscription, rx)
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Sends `changed` to every observer interested in one of its tables.
    pub fn dispatch(&self, changed: &BTreeSet<String>) {
        if changed.is_empty() {
            return;
        }
        tracing::debug!(tables = ?changed, "dispatching invalidation");
        for observer in self.observers.snapshot() {
            let hits: BTreeSet<String> = observer.tables.intersection(changed).cloned().collect();
            if !hits.is_empty() {
                (observer.callback)(&hits);
            }
        }
    }

    fn table_name(&self, table_id: TableId) -> Option<&str> {
        self.watched
            .iter()
            .find(|(id, _)| *id == table_id)
            .map(|(_, name)| name.as_str())
    }

    pub(crate) fn watched_names(&self) -> BTreeSet<String> {
        self.watched.iter().map(|(_, name)| name.clone()).collect()
    }

    fn flag_trigger(table_id: TableId, table: &str) -> TriggerDef {
        TriggerDef {
            name: format!("door_ch_{table}"),
            table: table.to_string(),
            events: TriggerEvent::ALL.to_vec(),
            scope: TriggerScope::Row,
            temporary: true,
            action: TriggerAction::SetFlag {
                flag_table: system::INVALIDATIONS_TABLE.into(),
                key_field: system::INVALIDATIONS_TABLE_ID.into(),
                key: i64::from(table_id),
                flag_field: system::INVALIDATIONS_FLAG.into(),
            },
        }
    }

    fn notify_trigger(&self, table: &str) -> TriggerDef {
        TriggerDef {
            name: format!("door_inv_{table}"),
            table: table.to_string(),
            events: TriggerEvent::ALL.to_vec(),
            scope: TriggerScope::Statement,
            temporary: false,
            action: TriggerAction::Notify {
                channel: self.channel.clone(),
            },
        }
    }

    /// Installs the persistent notify triggers (multi-writer only).
    pub(crate) fn install_persistent(&self, conn: &mut dyn Connection) -> CoreResult<()> {
        if self.dialect != Dialect::MultiWriter {
            return Ok(());
        }
        for (_, table) in &self.watched {
            let trigger = self.notify_trigger(table);
            conn.install_trigger(&trigger)
                .map_err(|e| CoreError::trigger_setup(e.to_string()))?;
        }
        Ok(())
    }

    /// Pre-block hook: installs the temporary dirty-bit triggers.
    pub(crate) fn before_block(&self, txn: &Transaction) -> CoreResult<()> {
        if self.dialect != Dialect::SingleWriter {
            return Ok(());
        }
        for (table_id, table) in &self.watched {
            let trigger = Self::flag_trigger(*table_id, table);
            txn.with_conn(|conn| conn.install_trigger(&trigger))
                .map_err(|e| CoreError::trigger_setup(e.to_string()))?;
        }
        Ok(())
    }

    /// Pre-commit hook: reads and clears the dirty bits.
    pub(crate) fn before_commit(&self, txn: &Transaction) -> CoreResult<BTreeSet<String>> {
        if self.dialect != Dialect::SingleWriter {
            return Ok(BTreeSet::new());
        }
        let dirty = txn.scan(system::INVALIDATIONS_TABLE, |row| {
            row.get(system::INVALIDATIONS_FLAG).and_then(Value::as_i64) == Some(1)
        })?;
        let mut changed = BTreeSet::new();
        for (key, _) in dirty {
            txn.with_conn(|conn| conn.delete(system::INVALIDATIONS_TABLE, key))?;
            let name = TableId::try_from(key.key1)
                .ok()
                .and_then(|id| self.table_name(id));
            match name {
                Some(name) => {
                    changed.insert(name.to_string());
                }
                None => tracing::warn!(key = %key, "dirty bit for unknown table id"),
            }
        }
        Ok(changed)
    }

    /// Starts the background listener (multi-writer only).
    pub(crate) fn start_listener(
        self: &Arc<Self>,
        source: Arc<dyn doordb_storage::DataSource>,
        retry: crate::config::ListenerRetry,
    ) {
        if self.dialect != Dialect::MultiWriter {
            return;
        }
        let handle = tokio::spawn(listener::run(
            Arc::downgrade(self),
            source,
            self.channel.clone(),
            retry,
        ));
        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stops the background listener.
    pub fn shutdown(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for ChangeTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
