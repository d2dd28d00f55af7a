//! # DoorDB Storage
//!
//! Connection and datasource abstractions for DoorDB.
//!
//! The replication core never talks to a database driver directly. It works
//! against the [`DataSource`] and [`Connection`] traits defined here, which
//! model the small relational surface replication needs:
//!
//! - keyed tables of JSON rows (`key1`, optional `key2`)
//! - explicit `BEGIN` / `COMMIT` / `ROLLBACK`
//! - declarative triggers ([`TriggerDef`]) that either set a dirty flag in a
//!   side table or `NOTIFY` a channel
//! - `LISTEN` on a notification channel (multi-writer dialect only)
//!
//! Two dialects exist. [`Dialect::SingleWriter`] behaves like SQLite: one
//! writer at a time, temporary triggers, no notification channels.
//! [`Dialect::MultiWriter`] behaves like Postgres: concurrent writers,
//! persistent statement-level triggers, `NOTIFY` delivered on commit.
//!
//! ## Available Backends
//!
//! - [`MemoryDataSource`] - in-memory reference backend for tests and
//!   embedded use, with statement logging and fault injection
//!
//! ## Example
//!
//! ```rust
//! use doordb_storage::{Connection, DataSource, MemoryDataSource, TableDef};
//! use serde_json::json;
//!
//! let ds = MemoryDataSource::single_writer();
//! let mut conn = ds.connect().unwrap();
//! conn.create_table(&TableDef::new("Person", "personUid")).unwrap();
//!
//! conn.begin().unwrap();
//! let row = json!({"personUid": 1, "name": "Ada"});
//! conn.insert("Person", row.as_object().unwrap().clone()).unwrap();
//! conn.commit().unwrap();
//!
//! assert_eq!(ds.row_count("Person"), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod memory;
mod table;
mod trigger;

pub use backend::{Connection, DataSource, Dialect, Notification, NotificationReceiver};
pub use error::{StorageError, StorageResult};
pub use memory::{MemoryConnection, MemoryDataSource, StatementRecord};
pub use table::{ChangeKind, Row, RowChange, RowKey, TableDef};
pub use trigger::{TriggerAction, TriggerDef, TriggerEvent, TriggerScope};
