//! In-memory relational backend.

use crate::backend::{Connection, DataSource, Dialect, Notification, NotificationReceiver};
use crate::error::{StorageError, StorageResult};
use crate::table::{ChangeKind, Row, RowChange, RowKey, TableDef};
use crate::trigger::{TriggerAction, TriggerDef, TriggerEvent};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A statement recorded by the statement log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementRecord {
    /// Connection that executed the statement.
    pub connection_id: u64,
    /// Statement text (`BEGIN`, `COMMIT`, `INSERT INTO Person`, trigger DDL...).
    pub statement: String,
}

#[derive(Debug)]
struct Table {
    def: TableDef,
    rows: BTreeMap<RowKey, Row>,
}

#[derive(Debug, Default)]
struct EngineState {
    tables: BTreeMap<String, Table>,
    triggers: Vec<TriggerDef>,
}

#[derive(Debug)]
struct Engine {
    dialect: Dialect,
    state: RwLock<EngineState>,
    listeners: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Notification>>>>,
    statement_log: Mutex<Option<Vec<StatementRecord>>>,
    next_connection_id: AtomicU64,
    open_connections: AtomicUsize,
    fail_trigger_installs: AtomicBool,
    fail_connects: AtomicBool,
}

impl Engine {
    fn log(&self, connection_id: u64, statement: impl Into<String>) {
        if let Some(log) = self.statement_log.lock().as_mut() {
            log.push(StatementRecord {
                connection_id,
                statement: statement.into(),
            });
        }
    }

    fn table_def(&self, table: &str) -> StorageResult<TableDef> {
        self.state
            .read()
            .tables
            .get(table)
            .map(|t| t.def.clone())
            .ok_or_else(|| StorageError::NoSuchTable(table.to_string()))
    }

    /// Makes `writes` visible. A guarded key whose committed row no longer
    /// matches its guard keeps the committed row: the conditional update
    /// matched nothing. Returns the number of such dropped writes.
    fn apply(
        &self,
        mut writes: HashMap<String, BTreeMap<RowKey, Option<Row>>>,
        guards: Vec<Guard>,
    ) -> usize {
        let mut state = self.state.write();
        let mut dropped = 0;
        for guard in guards {
            let holds = state
                .tables
                .get(&guard.table)
                .and_then(|t| t.rows.get(&guard.key))
                .is_some_and(|row| matches_fields(row, &guard.expected));
            if !holds {
                if let Some(rows) = writes.get_mut(&guard.table) {
                    rows.remove(&guard.key);
                }
                dropped += 1;
            }
        }
        for (table, rows) in writes {
            // Tables are never dropped, so a staged table always exists.
            let Some(target) = state.tables.get_mut(&table) else {
                continue;
            };
            for (key, row) in rows {
                match row {
                    Some(row) => {
                        target.rows.insert(key, row);
                    }
                    None => {
                        target.rows.remove(&key);
                    }
                }
            }
        }
        dropped
    }

    fn deliver(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        let mut listeners = self.listeners.lock();
        for notification in notifications {
            if let Some(senders) = listeners.get_mut(&notification.channel) {
                senders.retain(|tx| tx.send(notification.clone()).is_ok());
            }
        }
    }
}

/// In-memory [`DataSource`].
///
/// Cloning yields another handle to the same database. Committed state is
/// shared by all connections; each connection stages its transaction's
/// writes privately until commit.
///
/// Instrumentation hooks for tests:
/// - [`enable_statement_log`](Self::enable_statement_log) records every
///   statement with the executing connection id
/// - [`fail_trigger_installs`](Self::fail_trigger_installs) and
///   [`fail_connects`](Self::fail_connects) inject faults
/// - [`disconnect_listeners`](Self::disconnect_listeners) drops every `LISTEN`
#[derive(Debug, Clone)]
pub struct MemoryDataSource {
    engine: Arc<Engine>,
}

impl MemoryDataSource {
    /// Creates an empty database with the given dialect.
    #[must_use]
    pub fn new(dialect: Dialect) -> Self {
        Self {
            engine: Arc::new(Engine {
                dialect,
                state: RwLock::new(EngineState::default()),
                listeners: Mutex::new(HashMap::new()),
                statement_log: Mutex::new(None),
                next_connection_id: AtomicU64::new(1),
                open_connections: AtomicUsize::new(0),
                fail_trigger_installs: AtomicBool::new(false),
                fail_connects: AtomicBool::new(false),
            }),
        }
    }

    /// Creates an empty SQLite-like database.
    #[must_use]
    pub fn single_writer() -> Self {
        Self::new(Dialect::SingleWriter)
    }

    /// Creates an empty Postgres-like database.
    #[must_use]
    pub fn multi_writer() -> Self {
        Self::new(Dialect::MultiWriter)
    }

    /// Starts recording statements. Clears any previous log.
    pub fn enable_statement_log(&self) {
        *self.engine.statement_log.lock() = Some(Vec::new());
    }

    /// Returns the statements recorded so far.
    #[must_use]
    pub fn statement_log(&self) -> Vec<StatementRecord> {
        self.engine.statement_log.lock().clone().unwrap_or_default()
    }

    /// Makes every subsequent trigger installation fail.
    pub fn fail_trigger_installs(&self, fail: bool) {
        self.engine
            .fail_trigger_installs
            .store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent `connect` fail with a driver error.
    pub fn fail_connects(&self, fail: bool) {
        self.engine.fail_connects.store(fail, Ordering::SeqCst);
    }

    /// Drops all listener channels; receivers observe end of stream.
    pub fn disconnect_listeners(&self) {
        self.engine.listeners.lock().clear();
    }

    /// Number of live listeners on `channel`.
    #[must_use]
    pub fn listener_count(&self, channel: &str) -> usize {
        self.engine
            .listeners
            .lock()
            .get(channel)
            .map_or(0, |senders| senders.iter().filter(|s| !s.is_closed()).count())
    }

    /// Number of connections currently open.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.engine.open_connections.load(Ordering::SeqCst)
    }

    /// Number of committed rows in `table` (zero if it does not exist).
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.engine
            .state
            .read()
            .tables
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    /// Committed rows of `table` in key order.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.engine
            .state
            .read()
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of installed persistent triggers.
    #[must_use]
    pub fn persistent_triggers(&self) -> Vec<String> {
        self.engine
            .state
            .read()
            .triggers
            .iter()
            .map(|t| t.name.clone())
            .collect()
    }
}

impl DataSource for MemoryDataSource {
    fn dialect(&self) -> Dialect {
        self.engine.dialect
    }

    fn connect(&self) -> StorageResult<Box<dyn Connection>> {
        if self.engine.fail_connects.load(Ordering::SeqCst) {
            return Err(StorageError::Driver("connection refused".into()));
        }
        let id = self.engine.next_connection_id.fetch_add(1, Ordering::SeqCst);
        self.engine.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            id,
            engine: Arc::clone(&self.engine),
            txn: None,
        }))
    }

    fn listen(&self, channel: &str) -> StorageResult<NotificationReceiver> {
        if !self.engine.dialect.supports_notify() {
            return Err(StorageError::Unsupported {
                dialect: self.engine.dialect.name(),
                feature: "LISTEN".into(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.engine
            .listeners
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

/// Condition of an `update_if`, re-checked at commit.
#[derive(Debug)]
struct Guard {
    table: String,
    key: RowKey,
    expected: Row,
}

fn matches_fields(row: &Row, expected: &Row) -> bool {
    expected.iter().all(|(field, value)| row.get(field) == Some(value))
}

#[derive(Debug, Default)]
struct TxnState {
    writes: HashMap<String, BTreeMap<RowKey, Option<Row>>>,
    guards: Vec<Guard>,
    temp_triggers: Vec<TriggerDef>,
    changes: Vec<RowChange>,
    notifications: Vec<Notification>,
}

/// Connection to a [`MemoryDataSource`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    engine: Arc<Engine>,
    txn: Option<TxnState>,
}

impl MemoryConnection {
    fn autocommit<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> StorageResult<T>,
    ) -> StorageResult<T> {
        if self.txn.is_some() {
            return op(self);
        }
        self.begin()?;
        match op(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                self.rollback()?;
                Err(err)
            }
        }
    }

    fn read(&self, table: &str, key: RowKey) -> StorageResult<Option<Row>> {
        if let Some(staged) = self
            .txn
            .as_ref()
            .and_then(|txn| txn.writes.get(table))
            .and_then(|rows| rows.get(&key))
        {
            return Ok(staged.clone());
        }
        let state = self.engine.state.read();
        let target = state
            .tables
            .get(table)
            .ok_or_else(|| StorageError::NoSuchTable(table.to_string()))?;
        Ok(target.rows.get(&key).cloned())
    }

    fn fired_actions(&self, table: &str, event: TriggerEvent) -> Vec<TriggerAction> {
        let state = self.engine.state.read();
        let temp = self.txn.iter().flat_map(|txn| txn.temp_triggers.iter());
        state
            .triggers
            .iter()
            .chain(temp)
            .filter(|t| t.fires_on(table, event))
            .map(|t| t.action.clone())
            .collect()
    }

    fn stage(
        &mut self,
        table: &str,
        key: RowKey,
        row: Option<Row>,
        kind: ChangeKind,
    ) -> StorageResult<()> {
        let event = match kind {
            ChangeKind::Insert => TriggerEvent::Insert,
            ChangeKind::Update => TriggerEvent::Update,
            ChangeKind::Delete => TriggerEvent::Delete,
        };
        let actions = self.fired_actions(table, event);

        let txn = self.txn.as_mut().ok_or(StorageError::NoTransaction)?;
        txn.writes
            .entry(table.to_string())
            .or_default()
            .insert(key, row);
        txn.changes.push(RowChange {
            table: table.to_string(),
            key,
            kind,
        });

        // Trigger side effects are not statements: no change records, no recursion.
        for action in actions {
            match action {
                TriggerAction::SetFlag {
                    flag_table,
                    key_field,
                    key: flag_key,
                    flag_field,
                } => {
                    let def = self.engine.table_def(&flag_table)?;
                    let mut flag = Row::new();
                    flag.insert(key_field, Value::from(flag_key));
                    flag.insert(flag_field, Value::from(1));
                    let key = def.key_of(&flag)?;
                    txn.writes
                        .entry(flag_table)
                        .or_default()
                        .insert(key, Some(flag));
                }
                TriggerAction::Notify { channel } => {
                    let notification = Notification {
                        channel,
                        payload: table.to_string(),
                    };
                    if !txn.notifications.contains(&notification) {
                        txn.notifications.push(notification);
                    }
                }
            }
        }
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn dialect(&self) -> Dialect {
        self.engine.dialect
    }

    fn begin(&mut self) -> StorageResult<()> {
        if self.txn.is_some() {
            return Err(StorageError::TransactionActive);
        }
        self.engine.log(self.id, "BEGIN");
        self.txn = Some(TxnState::default());
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        let txn = self.txn.take().ok_or(StorageError::NoTransaction)?;
        tracing::trace!(
            connection = self.id,
            changes = txn.changes.len(),
            notifications = txn.notifications.len(),
            "commit"
        );
        let dropped = self.engine.apply(txn.writes, txn.guards);
        if dropped > 0 {
            tracing::debug!(connection = self.id, dropped, "conditional updates lost to concurrent commits");
        }
        self.engine.log(self.id, "COMMIT");
        self.engine.deliver(txn.notifications);
        Ok(())
    }

    fn rollback(&mut self) -> StorageResult<()> {
        self.txn.take().ok_or(StorageError::NoTransaction)?;
        self.engine.log(self.id, "ROLLBACK");
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    fn create_table(&mut self, table: &TableDef) -> StorageResult<()> {
        self.engine.log(self.id, table.create_sql());
        self.engine
            .state
            .write()
            .tables
            .entry(table.name.clone())
            .or_insert_with(|| Table {
                def: table.clone(),
                rows: BTreeMap::new(),
            });
        Ok(())
    }

    fn install_trigger(&mut self, trigger: &TriggerDef) -> StorageResult<bool> {
        let sql = trigger.to_sql(self.engine.dialect)?;
        if self.engine.fail_trigger_installs.load(Ordering::SeqCst) {
            return Err(StorageError::trigger_install(
                &trigger.name,
                "trigger installation disabled",
            ));
        }
        if !self.engine.state.read().tables.contains_key(&trigger.table) {
            return Err(StorageError::trigger_install(
                &trigger.name,
                format!("no such table: {}", trigger.table),
            ));
        }

        if trigger.temporary {
            let txn = self.txn.as_mut().ok_or(StorageError::NoTransaction)?;
            if txn.temp_triggers.iter().any(|t| t.name == trigger.name) {
                return Ok(false);
            }
            txn.temp_triggers.push(trigger.clone());
        } else {
            let mut state = self.engine.state.write();
            if state.triggers.iter().any(|t| t.name == trigger.name) {
                return Ok(false);
            }
            state.triggers.push(trigger.clone());
        }
        self.engine.log(self.id, sql);
        Ok(true)
    }

    fn insert(&mut self, table: &str, row: Row) -> StorageResult<RowKey> {
        self.autocommit(|conn| {
            let key = conn.engine.table_def(table)?.key_of(&row)?;
            if conn.read(table, key)?.is_some() {
                return Err(StorageError::DuplicateKey {
                    table: table.to_string(),
                    key,
                });
            }
            conn.engine.log(conn.id, format!("INSERT INTO {table}"));
            conn.stage(table, key, Some(row), ChangeKind::Insert)?;
            Ok(key)
        })
    }

    fn upsert(&mut self, table: &str, row: Row) -> StorageResult<RowKey> {
        self.autocommit(|conn| {
            let key = conn.engine.table_def(table)?.key_of(&row)?;
            let kind = if conn.read(table, key)?.is_some() {
                ChangeKind::Update
            } else {
                ChangeKind::Insert
            };
            conn.engine
                .log(conn.id, format!("INSERT OR REPLACE INTO {table}"));
            conn.stage(table, key, Some(row), kind)?;
            Ok(key)
        })
    }

    fn update_if(
        &mut self,
        table: &str,
        key: RowKey,
        expected: &Row,
        row: Row,
    ) -> StorageResult<bool> {
        self.autocommit(|conn| {
            if conn.engine.table_def(table)?.key_of(&row)? != key {
                return Err(StorageError::KeyChanged {
                    table: table.to_string(),
                    key,
                });
            }
            let Some(current) = conn.read(table, key)? else {
                return Ok(false);
            };
            if !matches_fields(&current, expected) {
                return Ok(false);
            }
            conn.engine.log(conn.id, format!("UPDATE {table} WHERE"));
            let staged_before = conn
                .txn
                .as_ref()
                .and_then(|txn| txn.writes.get(table))
                .is_some_and(|rows| rows.contains_key(&key));
            conn.stage(table, key, Some(row), ChangeKind::Update)?;
            // A row this transaction already wrote is its own; only rows read
            // from committed state can be changed under us.
            if !staged_before {
                if let Some(txn) = conn.txn.as_mut() {
                    txn.guards.push(Guard {
                        table: table.to_string(),
                        key,
                        expected: expected.clone(),
                    });
                }
            }
            Ok(true)
        })
    }

    fn delete(&mut self, table: &str, key: RowKey) -> StorageResult<bool> {
        self.autocommit(|conn| {
            if conn.read(table, key)?.is_none() {
                return Ok(false);
            }
            conn.engine.log(conn.id, format!("DELETE FROM {table}"));
            conn.stage(table, key, None, ChangeKind::Delete)?;
            Ok(true)
        })
    }

    fn get(&self, table: &str, key: RowKey) -> StorageResult<Option<Row>> {
        self.read(table, key)
    }

    fn scan(
        &self,
        table: &str,
        filter: &dyn Fn(&Row) -> bool,
    ) -> StorageResult<Vec<(RowKey, Row)>> {
        let mut rows = {
            let state = self.engine.state.read();
            state
                .tables
                .get(table)
                .ok_or_else(|| StorageError::NoSuchTable(table.to_string()))?
                .rows
                .clone()
        };
        if let Some(staged) = self.txn.as_ref().and_then(|txn| txn.writes.get(table)) {
            for (key, row) in staged {
                match row {
                    Some(row) => {
                        rows.insert(*key, row.clone());
                    }
                    None => {
                        rows.remove(key);
                    }
                }
            }
        }
        Ok(rows.into_iter().filter(|(_, row)| filter(row)).collect())
    }

    fn pending_changes(&self) -> &[RowChange] {
        self.txn.as_ref().map_or(&[], |txn| txn.changes.as_slice())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.txn.take().is_some() {
            self.engine.log(self.id, "ROLLBACK");
        }
        self.engine.open_connections.fetch_sub(1, Ordering::SeqCst);
    }
}
