//! # DoorDB Sync Protocol
//!
//! Wire types for node-to-node replication.
//!
//! This crate provides:
//! - [`DoorMessage`], the replication envelope carried by pull and push
//! - [`NodeEvent`], the outgoing event tuple emitted on commit
//! - [`SseEvent`] and [`SseDecoder`] for the subscription stream
//! - Pull, push and acknowledge request/response bodies
//! - [`HttpRequest`] / [`HttpResponse`], a framework-neutral HTTP surface
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod http;
mod messages;
mod requests;
mod sse;

pub use error::{ProtocolError, ProtocolResult};
pub use http::{endpoints, HttpMethod, HttpRequest, HttpResponse, NodeCredentials};
pub use messages::{DoorMessage, DoorReplicationEntity, MessageKind, NodeEvent, NodeId, TableId, Version};
pub use requests::{AckEntry, AckRequest, AckResponse, PullRequest, PullResponse, PushResponse};
pub use sse::{SseDecoder, SseEvent};
