//! # DoorDB Sync Engine
//!
//! Client side of DoorDB replication.
//!
//! This crate provides:
//! - [`SyncEngine`]: the subscription loop with reconciliation and push
//! - Retry with exponential backoff
//! - [`ReplicationTransport`], with an HTTP implementation over any
//!   [`HttpClient`]
//! - [`LoopbackClient`] for running against a server in the same process
//!
//! ## Architecture
//!
//! The client keeps an event stream open to its server. The stream carries
//! no data, only which table to pull:
//! 1. `INIT` names the server; the client registers it as a remote node so
//!    local writes get tracked for it
//! 2. The client pulls every table, then pushes everything pending for the
//!    server
//! 3. Each `INVALIDATE` triggers a pull of that table; each local commit
//!    that touches rows for the server triggers a push
//!
//! ## Key Invariants
//!
//! - Pulled entities are acknowledged only after they were applied locally
//! - Pushed entities are marked delivered only after the server accepted them
//! - Every reconnect reconciles all tables, so nothing missed while offline
//!   depends on the event stream

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod http;
mod transport;

pub use config::{RetryConfig, SyncConfig};
pub use engine::{SyncCycleResult, SyncEngine, SyncState, SyncStats};
pub use error::{SyncError, SyncResult};
pub use http::{HttpClient, HttpTransport, LoopbackClient, LoopbackServer, StreamOpen};
pub use transport::{ChunkStream, EventStream, ReplicationTransport};
