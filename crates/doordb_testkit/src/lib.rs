//! # DoorDB Testkit
//!
//! Test utilities for DoorDB.
//!
//! This crate provides:
//! - A sample schema and in-memory node fixtures
//! - Property-based test generators using proptest
//! - Tracing setup for test binaries
//!
//! ## Usage
//!
//! ```rust,ignore
//! use doordb_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_node() {
//!     init_tracing();
//!     let (_source, db) = open_memory_node(1).await;
//!     put_person(&db, 10, 1).await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
mod tracing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::tracing::init_tracing;
}

pub use fixtures::*;
pub use generators::*;
pub use tracing::init_tracing;
