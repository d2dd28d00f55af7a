//! Request and response bodies for the pull, push and acknowledge endpoints.

use crate::messages::{DoorMessage, TableId, Version};
use serde::{Deserialize, Serialize};

/// Asks for pending entities of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Table to pull.
    pub table_id: TableId,
    /// Maximum number of entities to return.
    pub limit: usize,
}

/// Entities pending for the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// The entities, as a `pull` message.
    pub message: DoorMessage,
    /// True if more pending entities remain beyond `limit`.
    pub has_more: bool,
}

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    /// Entities actually written (version-equal entities are skipped).
    pub applied: usize,
}

/// One acknowledged entity version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckEntry {
    /// Table of the entity.
    pub table_id: TableId,
    /// First key column.
    pub key1: i64,
    /// Second key column.
    #[serde(default)]
    pub key2: i64,
    /// Version the receiver applied.
    pub version: Version,
}

/// Acknowledges applied entity versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRequest {
    /// Applied versions.
    pub acks: Vec<AckEntry>,
}

/// Result of an acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    /// Tracker rows whose pending flag was cleared.
    pub cleared: usize,
}
