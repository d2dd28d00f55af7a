//! System tables owned by the replication core.

use doordb_storage::TableDef;

/// Dirty-bit table written by single-writer change tracking triggers.
pub const INVALIDATIONS_TABLE: &str = "DoorInvalidations";
/// Key column of [`INVALIDATIONS_TABLE`].
pub const INVALIDATIONS_TABLE_ID: &str = "tableId";
/// Flag column of [`INVALIDATIONS_TABLE`].
pub const INVALIDATIONS_FLAG: &str = "invalid";

/// Remote peers known to this node.
pub const NODE_TABLE: &str = "DoorNode";
/// Key column of [`NODE_TABLE`].
pub const NODE_ID: &str = "nodeId";
/// Auth token digest column of [`NODE_TABLE`].
pub const NODE_AUTH: &str = "auth";

/// This node's own identity (a single row).
pub const SYNC_NODE_TABLE: &str = "SyncNode";
/// Key column of [`SYNC_NODE_TABLE`].
pub const SYNC_NODE_KEY: &str = "syncNodeUid";
/// Node id column of [`SYNC_NODE_TABLE`].
pub const SYNC_NODE_ID: &str = "nodeId";
/// Auth token column of [`SYNC_NODE_TABLE`].
pub const SYNC_NODE_TOKEN: &str = "authToken";

/// Explicit outgoing replication requests, consumed at commit.
pub const OUTGOING_TABLE: &str = "OutgoingReplication";
/// Key column of [`OUTGOING_TABLE`].
pub const OUTGOING_KEY: &str = "orUid";
/// Destination node column of [`OUTGOING_TABLE`].
pub const OUTGOING_DEST: &str = "destNodeId";
/// Table id column of [`OUTGOING_TABLE`].
pub const OUTGOING_TABLE_ID: &str = "tableId";
/// Entity key column of [`OUTGOING_TABLE`].
pub const OUTGOING_ENTITY_KEY: &str = "key1";

/// Entity key column of every tracker table.
pub const TRACKER_PK: &str = "pk";
/// Destination node column of every tracker table.
pub const TRACKER_DESTINATION: &str = "destination";
/// Last known version column of every tracker table.
pub const TRACKER_VERSION: &str = "version";
/// Pending flag column of every tracker table.
pub const TRACKER_PENDING: &str = "pending";

/// Definitions of the fixed system tables.
pub fn system_tables() -> [TableDef; 4] {
    [
        TableDef::new(INVALIDATIONS_TABLE, INVALIDATIONS_TABLE_ID),
        TableDef::new(NODE_TABLE, NODE_ID),
        TableDef::new(SYNC_NODE_TABLE, SYNC_NODE_KEY),
        TableDef::new(OUTGOING_TABLE, OUTGOING_KEY),
    ]
}
