//! Per-destination replication tracking.
//!
//! Every replicable entity has a tracker table keyed by (entity pk,
//! destination node) that stores the last version known to be at, or bound
//! for, that destination and a `pending` flag. The tracker runs as a
//! [`CommitHook`]: rows changed by a transaction are compared against their
//! tracker rows before commit and marked pending where the version moved.

use crate::entity::{EntityRegistry, ReplicableEntity};
use crate::error::{CoreError, CoreResult};
use crate::node;
use crate::system;
use crate::transaction::{CommitHook, Transaction};
use crate::types::{NodeId, TableId, Version};
use doordb_storage::{ChangeKind, Row, RowKey};
use doordb_sync_protocol::{AckEntry, MessageKind, NodeEvent};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Stored state of one tracker row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerState {
    /// Last version recorded for the destination.
    pub version: Version,
    /// True until the destination acknowledges `version`.
    pub pending: bool,
}

/// An entity row waiting to be sent to a node.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntity {
    /// Table of the row.
    pub table_id: TableId,
    /// Primary key of the row.
    pub pk: i64,
    /// Version recorded in the tracker.
    pub version: Version,
    /// The live row.
    pub row: Row,
}

/// Decides what must be sent where.
pub struct ReplicationTracker {
    registry: Arc<EntityRegistry>,
    next_marker: AtomicI64,
}

impl ReplicationTracker {
    /// Creates a tracker over `registry`.
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self {
            registry,
            next_marker: AtomicI64::new(1),
        }
    }

    /// Reads the tracker row for `(pk, node)`.
    pub fn state(
        &self,
        txn: &Transaction,
        table_id: TableId,
        pk: i64,
        node: NodeId,
    ) -> CoreResult<Option<TrackerState>> {
        let entity = self.registry.require(table_id)?;
        read_state(txn, entity, pk, node)
    }

    /// Marks `(pk, node)` pending at `version` unless the tracker already
    /// holds that version. Returns true if a mark was written.
    pub fn mark(
        &self,
        txn: &Transaction,
        entity: &ReplicableEntity,
        pk: i64,
        node: NodeId,
        version: Version,
    ) -> CoreResult<bool> {
        if let Some(state) = read_state(txn, entity, pk, node)? {
            if state.version == version {
                return Ok(false);
            }
        }
        write_state(txn, entity, pk, node, version, true)?;
        Ok(true)
    }

    /// Creates tracker rows for every row currently qualifying for `node`.
    ///
    /// Returns the number of rows marked pending.
    pub fn seed_node(&self, txn: &Transaction, node: NodeId) -> CoreResult<usize> {
        let mut seeded = 0;
        for entity in self.registry.iter() {
            for (key, row) in txn.scan(&entity.table_name, |_| true)? {
                if !entity.destinations.includes(&row, node) {
                    continue;
                }
                let version = entity.version_of(&row)?;
                write_state(txn, entity, key.key1, node, version, true)?;
                seeded += 1;
            }
        }
        tracing::debug!(node, seeded, "tracker rows seeded");
        Ok(seeded)
    }

    /// Pending rows for `node`, in send order (priority, table id, pk), at
    /// most `limit`. Rows that no longer exist or no longer qualify for
    /// `node` are skipped.
    pub fn pending_for_node(
        &self,
        txn: &Transaction,
        node: NodeId,
        table_id: Option<TableId>,
        limit: usize,
    ) -> CoreResult<Vec<PendingEntity>> {
        let mut pending = Vec::new();
        for entity in self.registry.in_send_order() {
            if table_id.is_some_and(|id| id != entity.table_id) {
                continue;
            }
            for (key, tracker) in txn.scan(&entity.tracker_table(), |row| {
                is_pending_for(row, node)
            })? {
                if pending.len() >= limit {
                    return Ok(pending);
                }
                let Some(row) = txn.get(&entity.table_name, RowKey::single(key.key1))? else {
                    continue;
                };
                if !entity.destinations.includes(&row, node) {
                    continue;
                }
                pending.push(PendingEntity {
                    table_id: entity.table_id,
                    pk: key.key1,
                    version: tracker_version(&tracker),
                    row,
                });
            }
        }
        Ok(pending)
    }

    /// Tables with at least one pending row for `node`, in send order.
    pub fn pending_tables(&self, txn: &Transaction, node: NodeId) -> CoreResult<Vec<TableId>> {
        let mut tables = Vec::new();
        for entity in self.registry.in_send_order() {
            if !self
                .pending_for_node(txn, node, Some(entity.table_id), 1)?
                .is_empty()
            {
                tables.push(entity.table_id);
            }
        }
        Ok(tables)
    }

    /// Applies acknowledgements from `node`.
    ///
    /// A pending flag is cleared only when the acknowledged version equals
    /// the stored one; stale acks leave the row pending. Returns the number
    /// of rows cleared.
    pub fn acknowledge(&self, txn: &Transaction, node: NodeId, acks: &[AckEntry]) -> CoreResult<usize> {
        let mut cleared = 0;
        for ack in acks {
            let Some(entity) = self.registry.by_id(ack.table_id) else {
                tracing::warn!(node, table_id = ack.table_id, "ack for unknown table ignored");
                continue;
            };
            match read_state(txn, entity, ack.key1, node)? {
                Some(state) if state.pending && state.version == ack.version => {
                    // The version and flag must still be the acknowledged
                    // ones when the clear lands; a concurrent mark wins.
                    let mut expected = Row::new();
                    expected.insert(system::TRACKER_VERSION.into(), Value::from(ack.version));
                    expected.insert(system::TRACKER_PENDING.into(), Value::from(true));
                    let cleared_row = tracker_row(ack.key1, node, ack.version, false);
                    if txn.update_if(
                        &entity.tracker_table(),
                        RowKey::new(ack.key1, node),
                        &expected,
                        cleared_row,
                    )? {
                        cleared += 1;
                    }
                }
                Some(state) if state.pending => {
                    tracing::debug!(
                        node,
                        table_id = ack.table_id,
                        pk = ack.key1,
                        acked = ack.version,
                        stored = state.version,
                        "stale ack"
                    );
                }
                _ => {}
            }
        }
        Ok(cleared)
    }

    /// Records that `node` already holds `version` (received from it).
    pub fn record_received(
        &self,
        txn: &Transaction,
        entity: &ReplicableEntity,
        pk: i64,
        node: NodeId,
        version: Version,
    ) -> CoreResult<()> {
        write_state(txn, entity, pk, node, version, false)
    }

    /// Drops the tracker row of `(pk, node)` if it is still pending.
    ///
    /// Used when the row stopped qualifying for `node`: whatever was bound
    /// for it must not be sent, and a later mark starts afresh.
    fn withdraw(&self, txn: &Transaction, entity: &ReplicableEntity, pk: i64, node: NodeId) -> CoreResult<bool> {
        match read_state(txn, entity, pk, node)? {
            Some(state) if state.pending => {
                txn.delete(&entity.tracker_table(), RowKey::new(pk, node))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Drops the pending tracker rows of a deleted entity row.
    fn forget_row(&self, txn: &Transaction, entity: &ReplicableEntity, pk: i64) -> CoreResult<()> {
        let table = entity.tracker_table();
        let rows = txn.scan(&table, |row| {
            row.get(system::TRACKER_PK).and_then(Value::as_i64) == Some(pk)
                && row.get(system::TRACKER_PENDING).and_then(Value::as_bool) == Some(true)
        })?;
        for (key, _) in rows {
            txn.delete(&table, key)?;
        }
        Ok(())
    }

    /// Deletes every tracker row for `node`. Returns the number deleted.
    pub fn remove_node(&self, txn: &Transaction, node: NodeId) -> CoreResult<usize> {
        let mut removed = 0;
        for entity in self.registry.iter() {
            let table = entity.tracker_table();
            let rows = txn.scan(&table, |row| {
                row.get(system::TRACKER_DESTINATION).and_then(Value::as_i64) == Some(node)
            })?;
            for (key, _) in rows {
                if txn.delete(&table, key)? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Requests that row `pk` of `table_id` be sent to `destination` on
    /// commit, whatever its tracker says.
    pub fn queue_outgoing(
        &self,
        txn: &Transaction,
        destination: NodeId,
        table_id: TableId,
        pk: i64,
    ) -> CoreResult<()> {
        self.registry.require(table_id)?;
        let mut marker = Row::new();
        marker.insert(
            system::OUTGOING_KEY.into(),
            Value::from(self.next_marker.fetch_add(1, Ordering::Relaxed)),
        );
        marker.insert(system::OUTGOING_DEST.into(), Value::from(destination));
        marker.insert(system::OUTGOING_TABLE_ID.into(), Value::from(table_id));
        marker.insert(system::OUTGOING_ENTITY_KEY.into(), Value::from(pk));
        txn.insert(system::OUTGOING_TABLE, marker)?;
        Ok(())
    }

    fn consume_marker(
        &self,
        txn: &Transaction,
        key: RowKey,
        events: &mut EventSet,
    ) -> CoreResult<()> {
        let Some(marker) = txn.get(system::OUTGOING_TABLE, key)? else {
            return Ok(());
        };
        txn.delete(system::OUTGOING_TABLE, key)?;

        let field = |name: &str| marker.get(name).and_then(Value::as_i64);
        let (Some(destination), Some(table_id), Some(pk)) = (
            field(system::OUTGOING_DEST),
            field(system::OUTGOING_TABLE_ID).and_then(|id| TableId::try_from(id).ok()),
            field(system::OUTGOING_ENTITY_KEY),
        ) else {
            return Err(CoreError::invalid_entity(system::OUTGOING_TABLE, "incomplete marker"));
        };
        let entity = self.registry.require(table_id)?;
        let Some(row) = txn.get(&entity.table_name, RowKey::single(pk))? else {
            tracing::debug!(table_id, pk, "outgoing marker for missing row dropped");
            return Ok(());
        };
        let version = entity.version_of(&row)?;
        write_state(txn, entity, pk, destination, version, true)?;
        events.push(destination, table_id, pk);
        Ok(())
    }
}

impl CommitHook for ReplicationTracker {
    fn before_commit(&self, txn: &Transaction) -> CoreResult<Vec<NodeEvent>> {
        let changes = txn.changes()?;
        let mut events = EventSet::default();
        let mut nodes: Option<Vec<NodeId>> = None;

        for change in &changes {
            if change.table == system::OUTGOING_TABLE {
                if change.kind != ChangeKind::Delete {
                    self.consume_marker(txn, change.key, &mut events)?;
                }
                continue;
            }
            let Some(entity) = self.registry.by_name(&change.table) else {
                continue;
            };
            if change.kind == ChangeKind::Delete {
                self.forget_row(txn, entity, change.key.key1)?;
                continue;
            }
            let Some(row) = txn.get(&change.table, change.key)? else {
                continue;
            };
            let origin = txn.origin_of(&change.table, change.key);
            let version = entity.version_of(&row)?;
            let pk = change.key.key1;

            if nodes.is_none() {
                nodes = Some(
                    node::list_nodes(txn)?
                        .into_iter()
                        .map(|n| n.node_id)
                        .collect(),
                );
            }
            for &destination in nodes.as_deref().unwrap_or_default() {
                if !entity.destinations.includes(&row, destination) {
                    if self.withdraw(txn, entity, pk, destination)? {
                        tracing::debug!(
                            table_id = entity.table_id,
                            pk,
                            destination,
                            "row no longer qualifies, pending send withdrawn"
                        );
                    }
                    continue;
                }
                if origin == Some(destination) {
                    self.record_received(txn, entity, pk, destination, version)?;
                } else if self.mark(txn, entity, pk, destination, version)? {
                    events.push(destination, entity.table_id, pk);
                }
            }
        }
        Ok(events.into_vec())
    }
}

#[derive(Default)]
struct EventSet {
    seen: HashSet<NodeEvent>,
    events: Vec<NodeEvent>,
}

impl EventSet {
    fn push(&mut self, to_node: NodeId, table_id: TableId, pk: i64) {
        let event = NodeEvent {
            what: MessageKind::Invalidate,
            to_node,
            table_id,
            key1: pk,
            key2: 0,
        };
        if self.seen.insert(event) {
            self.events.push(event);
        }
    }

    fn into_vec(self) -> Vec<NodeEvent> {
        self.events
    }
}

fn is_pending_for(row: &Row, node: NodeId) -> bool {
    row.get(system::TRACKER_DESTINATION).and_then(Value::as_i64) == Some(node)
        && row.get(system::TRACKER_PENDING).and_then(Value::as_bool) == Some(true)
}

fn tracker_version(row: &Row) -> Version {
    row.get(system::TRACKER_VERSION)
        .and_then(Value::as_i64)
        .unwrap_or_default()
}

fn read_state(
    txn: &Transaction,
    entity: &ReplicableEntity,
    pk: i64,
    node: NodeId,
) -> CoreResult<Option<TrackerState>> {
    Ok(txn
        .get(&entity.tracker_table(), RowKey::new(pk, node))?
        .map(|row| TrackerState {
            version: tracker_version(&row),
            pending: row
                .get(system::TRACKER_PENDING)
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }))
}

fn tracker_row(pk: i64, node: NodeId, version: Version, pending: bool) -> Row {
    let mut row = Row::new();
    row.insert(system::TRACKER_PK.into(), Value::from(pk));
    row.insert(system::TRACKER_DESTINATION.into(), Value::from(node));
    row.insert(system::TRACKER_VERSION.into(), Value::from(version));
    row.insert(system::TRACKER_PENDING.into(), Value::from(pending));
    row
}

fn write_state(
    txn: &Transaction,
    entity: &ReplicableEntity,
    pk: i64,
    node: NodeId,
    version: Version,
    pending: bool,
) -> CoreResult<()> {
    txn.upsert(&entity.tracker_table(), tracker_row(pk, node, version, pending))?;
    Ok(())
}
