//! # DoorDB Sync Server
//!
//! Server side of DoorDB replication.
//!
//! This crate provides:
//! - The connect endpoint: a server-sent event stream per subscribed node
//! - Pull, push and acknowledge endpoints
//! - Node authentication against the `DoorNode` table
//! - Fan-out of committed changes to subscribers
//!
//! # Architecture
//!
//! The server is an ordinary [`DoorDatabase`](doordb_core::DoorDatabase)
//! node. Every other node that talks to it gets its own tracker rows, so
//! what it still has to receive survives restarts on both sides. The event
//! stream only says *which table* to pull; the rows themselves always travel
//! through pull requests, and nothing is considered delivered until the
//! receiver acknowledges the version it applied.
//!
//! # Authentication
//!
//! Every request carries `door-node` and `door-auth` headers. The server
//! stores the SHA-256 digest of the token. Unknown nodes are registered on
//! first contact unless trust-on-first-use is disabled:
//!
//! ```rust,ignore
//! use doordb_sync_server::{ServerConfig, SyncServer};
//!
//! let config = ServerConfig::default().with_trust_on_first_use(false);
//! let server = SyncServer::new(db, config)?;
//! server.register_node(42, "token-for-42").await?;
//! ```
//!
//! # Protocol
//!
//! 1. Client connects and receives `INIT` with the server's node id
//! 2. Server sends `INVALIDATE` for every table with rows pending for it
//! 3. Client pulls each invalidated table, applies it, and acknowledges
//! 4. Client pushes its own pending rows

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod server;
mod subscribers;

pub use auth::{token_digest, AuthOutcome, NodeIdAuthCache};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use server::SyncServer;
pub use subscribers::{SseStream, SubscriberRegistry};
