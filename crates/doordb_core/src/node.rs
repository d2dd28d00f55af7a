//! Node identity: the local `SyncNode` row and the remote `DoorNode` table.

use crate::error::{CoreError, CoreResult};
use crate::system;
use crate::transaction::Transaction;
use crate::types::NodeId;
use doordb_storage::{Row, RowKey};
use rand::Rng;
use serde_json::Value;

/// A remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoorNode {
    /// The peer's node id.
    pub node_id: NodeId,
    /// Stored credential for the peer (a token digest on servers, empty when
    /// the peer never authenticates to us).
    pub auth: String,
}

impl DoorNode {
    /// Creates a node record.
    pub fn new(node_id: NodeId, auth: impl Into<String>) -> Self {
        Self {
            node_id,
            auth: auth.into(),
        }
    }

    fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert(system::NODE_ID.into(), Value::from(self.node_id));
        row.insert(system::NODE_AUTH.into(), Value::from(self.auth.clone()));
        row
    }

    fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            node_id: row.get(system::NODE_ID)?.as_i64()?,
            auth: row
                .get(system::NODE_AUTH)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// This node's identity.
#[derive(Clone, PartialEq, Eq)]
pub struct LocalNode {
    /// This node's id.
    pub node_id: NodeId,
    /// Token this node presents to servers.
    pub auth_token: String,
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

const LOCAL_ROW: RowKey = RowKey::single(1);

/// Loads the local identity, creating it on first open.
///
/// A configured id must match the stored one; node ids never change once
/// assigned. Generated ids fall in `1..=max_node_id`.
pub(crate) fn load_or_create_local(
    txn: &Transaction,
    configured: Option<NodeId>,
    max_node_id: NodeId,
) -> CoreResult<LocalNode> {
    if let Some(row) = txn.get(system::SYNC_NODE_TABLE, LOCAL_ROW)? {
        let stored = row
            .get(system::SYNC_NODE_ID)
            .and_then(Value::as_i64)
            .ok_or_else(|| CoreError::invalid_entity(system::SYNC_NODE_TABLE, "missing nodeId"))?;
        if let Some(configured) = configured {
            if configured != stored {
                return Err(CoreError::NodeIdMismatch { stored, configured });
            }
        }
        let auth_token = row
            .get(system::SYNC_NODE_TOKEN)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Ok(LocalNode {
            node_id: stored,
            auth_token,
        });
    }

    let node_id = match configured {
        Some(id) => id,
        None => rand::thread_rng().gen_range(1..=max_node_id),
    };
    let auth_token = uuid::Uuid::new_v4().to_string();
    let mut row = Row::new();
    row.insert(system::SYNC_NODE_KEY.into(), Value::from(LOCAL_ROW.key1));
    row.insert(system::SYNC_NODE_ID.into(), Value::from(node_id));
    row.insert(system::SYNC_NODE_TOKEN.into(), Value::from(auth_token.clone()));
    txn.insert(system::SYNC_NODE_TABLE, row)?;
    tracing::info!(node_id, generated = configured.is_none(), "local node identity created");
    Ok(LocalNode {
        node_id,
        auth_token,
    })
}

/// Looks up a remote node.
pub fn get_node(txn: &Transaction, node_id: NodeId) -> CoreResult<Option<DoorNode>> {
    Ok(txn
        .get(system::NODE_TABLE, RowKey::single(node_id))?
        .as_ref()
        .and_then(DoorNode::from_row))
}

/// All remote nodes, ordered by id.
pub fn list_nodes(txn: &Transaction) -> CoreResult<Vec<DoorNode>> {
    Ok(txn
        .scan(system::NODE_TABLE, |_| true)?
        .iter()
        .filter_map(|(_, row)| DoorNode::from_row(row))
        .collect())
}

/// Inserts or replaces a remote node. Returns true if it was new.
pub fn put_node(txn: &Transaction, node: &DoorNode) -> CoreResult<bool> {
    let existed = get_node(txn, node.node_id)?.is_some();
    txn.upsert(system::NODE_TABLE, node.to_row())?;
    Ok(!existed)
}

/// Deletes a remote node. Returns true if it existed.
pub fn delete_node(txn: &Transaction, node_id: NodeId) -> CoreResult<bool> {
    txn.delete(system::NODE_TABLE, RowKey::single(node_id))
}
