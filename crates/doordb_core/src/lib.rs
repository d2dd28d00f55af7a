//! # DoorDB Core
//!
//! Replication core for DoorDB.
//!
//! This crate provides:
//! - Change tracking: per-table invalidations delivered to observers after
//!   commit ([`ChangeTracker`])
//! - Transaction coordination over single- and multi-writer backends
//!   ([`TransactionCoordinator`], [`Transaction`])
//! - Per-destination replication tracking ([`ReplicationTracker`])
//! - Outgoing and incoming node event streams ([`NodeEventManager`])
//! - Node-partitioned primary keys ([`PrimaryKeyManager`])
//! - The [`DoorDatabase`] facade tying them together
//!
//! ## Example
//!
//! ```rust
//! use doordb_core::{
//!     CoreError, DatabaseConfig, DoorDatabase, EntityRegistry, ReplicableEntity,
//!     TransactionMode,
//! };
//! use doordb_storage::MemoryDataSource;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), CoreError> {
//! let registry = EntityRegistry::new()
//!     .with(ReplicableEntity::new(1, "Person", "personUid", "etag"))?;
//! let source = Arc::new(MemoryDataSource::single_writer());
//! let db = DoorDatabase::open(source, registry, DatabaseConfig::new().with_node_id(7)).await?;
//!
//! db.register_node(42, "token").await?;
//! let key = db.next_key(1)?;
//! db.with_transaction(TransactionMode::ReadWrite, |txn| async move {
//!     let row = json!({"personUid": key, "etag": 1, "name": "Ada"});
//!     txn.insert("Person", row.as_object().cloned().unwrap_or_default())?;
//!     Ok::<_, CoreError>(())
//! })
//! .await?;
//!
//! assert_eq!(db.pending_for_node(42, None, 10).await?.len(), 1);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_tracker;
mod config;
mod database;
mod entity;
mod error;
mod keys;
pub mod node;
mod node_events;
mod pool;
mod replication;
mod subscription;
pub mod system;
mod transaction;
mod types;

pub use change_tracker::ChangeTracker;
pub use config::{DatabaseConfig, ListenerRetry};
pub use database::DoorDatabase;
pub use entity::{
    ApplyPolicy, DestinationRule, EntityRegistry, ReceiveGuard, ReceiveRule, ReplicableEntity,
};
pub use error::{CoreError, CoreResult};
pub use keys::PrimaryKeyManager;
pub use node::{DoorNode, LocalNode};
pub use node_events::{ApplyOutcome, NodeEventManager, PendingBatch, DEFAULT_EVENT_CAPACITY};
pub use pool::{ConnectionPool, PooledConnection};
pub use replication::{PendingEntity, ReplicationTracker, TrackerState};
pub use subscription::Subscription;
pub use transaction::{CommitHook, CommitReport, Transaction, TransactionCoordinator};
pub use types::{NodeId, TableId, TransactionId, TransactionMode, Version};
