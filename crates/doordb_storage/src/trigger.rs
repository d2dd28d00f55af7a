//! Declarative trigger definitions.
//!
//! A [`TriggerDef`] is data, not SQL. Real drivers render it with
//! [`TriggerDef::to_sql`]; the in-memory backend interprets the
//! [`TriggerAction`] directly.

use crate::backend::Dialect;
use crate::error::{StorageError, StorageResult};

/// Statement kind a trigger reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerEvent {
    /// `AFTER INSERT`.
    Insert,
    /// `AFTER UPDATE`.
    Update,
    /// `AFTER DELETE`.
    Delete,
}

impl TriggerEvent {
    /// All three events.
    pub const ALL: [TriggerEvent; 3] = [
        TriggerEvent::Insert,
        TriggerEvent::Update,
        TriggerEvent::Delete,
    ];

    fn keyword(self) -> &'static str {
        match self {
            TriggerEvent::Insert => "INSERT",
            TriggerEvent::Update => "UPDATE",
            TriggerEvent::Delete => "DELETE",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            TriggerEvent::Insert => "ins",
            TriggerEvent::Update => "upd",
            TriggerEvent::Delete => "del",
        }
    }
}

/// Whether a trigger fires once per row or once per statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerScope {
    /// `FOR EACH ROW`.
    Row,
    /// `FOR EACH STATEMENT`.
    Statement,
}

/// What a trigger does when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerAction {
    /// Upserts `{key_field: key, flag_field: 1}` into `flag_table`.
    SetFlag {
        /// Side table holding the flags.
        flag_table: String,
        /// Key column of the side table.
        key_field: String,
        /// Key value written (the watched table's id).
        key: i64,
        /// Flag column set to 1.
        flag_field: String,
    },
    /// Sends the watched table's name on `channel` when the transaction commits.
    Notify {
        /// Notification channel.
        channel: String,
    },
}

/// A trigger on one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDef {
    /// Trigger name, unique per connection (temporary) or database.
    pub name: String,
    /// Watched table.
    pub table: String,
    /// Events the trigger fires on.
    pub events: Vec<TriggerEvent>,
    /// Row or statement scope.
    pub scope: TriggerScope,
    /// Temporary triggers live only until the end of the current transaction.
    pub temporary: bool,
    /// The action to perform.
    pub action: TriggerAction,
}

impl TriggerDef {
    /// Returns true if this trigger fires for `event` on `table`.
    pub fn fires_on(&self, table: &str, event: TriggerEvent) -> bool {
        self.table == table && self.events.contains(&event)
    }

    /// Renders the DDL for `dialect`.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` for actions the dialect cannot express
    /// (`NOTIFY` on a single-writer engine).
    pub fn to_sql(&self, dialect: Dialect) -> StorageResult<String> {
        match (&self.action, dialect) {
            (
                TriggerAction::SetFlag {
                    flag_table,
                    key_field,
                    key,
                    flag_field,
                },
                Dialect::SingleWriter,
            ) => {
                // SQLite triggers take a single event each.
                let temp = if self.temporary { "TEMP " } else { "" };
                let statements: Vec<String> = self
                    .events
                    .iter()
                    .map(|event| {
                        format!(
                            "CREATE {temp}TRIGGER IF NOT EXISTS {name}_{suffix} AFTER {kw} ON {table} BEGIN \
                             INSERT OR REPLACE INTO {flag_table}({key_field}, {flag_field}) VALUES ({key}, 1); END",
                            name = self.name,
                            suffix = event.suffix(),
                            kw = event.keyword(),
                            table = self.table,
                        )
                    })
                    .collect();
                Ok(statements.join(";\n"))
            }
            (
                TriggerAction::SetFlag {
                    flag_table,
                    key_field,
                    key,
                    flag_field,
                },
                Dialect::MultiWriter,
            ) => {
                let function = format!("{}_fn", self.name);
                Ok(format!(
                    "CREATE OR REPLACE FUNCTION {function}() RETURNS TRIGGER AS $$ BEGIN \
                     INSERT INTO {flag_table}({key_field}, {flag_field}) VALUES ({key}, 1) \
                     ON CONFLICT ({key_field}) DO UPDATE SET {flag_field} = 1; RETURN NULL; END $$ LANGUAGE plpgsql;\n{}",
                    self.pg_trigger(&function)
                ))
            }
            (TriggerAction::Notify { channel }, Dialect::MultiWriter) => {
                let function = format!("{channel}_notify");
                Ok(format!(
                    "CREATE OR REPLACE FUNCTION {function}() RETURNS TRIGGER AS $$ BEGIN \
                     PERFORM pg_notify('{channel}', TG_TABLE_NAME); RETURN NULL; END $$ LANGUAGE plpgsql;\n{}",
                    self.pg_trigger(&function)
                ))
            }
            (TriggerAction::Notify { .. }, Dialect::SingleWriter) => Err(StorageError::Unsupported {
                dialect: dialect.name(),
                feature: "NOTIFY".into(),
            }),
        }
    }

    fn pg_trigger(&self, function: &str) -> String {
        let events: Vec<&str> = self.events.iter().map(|e| e.keyword()).collect();
        let scope = match self.scope {
            TriggerScope::Row => "ROW",
            TriggerScope::Statement => "STATEMENT",
        };
        format!(
            "CREATE OR REPLACE TRIGGER {} AFTER {} ON {} FOR EACH {} EXECUTE FUNCTION {}()",
            self.name,
            events.join(" OR "),
            self.table,
            scope,
            function
        )
    }
}
