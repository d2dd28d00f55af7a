//! Static registry of replicable entities.
//!
//! The registry is plain data built once at startup (typically by generated
//! code) and injected into every component that needs entity metadata.

use crate::error::{CoreError, CoreResult};
use crate::system;
use crate::types::{NodeId, TableId, Version};
use doordb_storage::{Row, RowKey, TableDef};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Chooses the nodes an entity row is replicated to.
#[derive(Clone, Default)]
pub enum DestinationRule {
    /// Every registered node.
    #[default]
    AllNodes,
    /// Nodes for which the predicate returns true.
    Filtered(Arc<dyn Fn(&Row, NodeId) -> bool + Send + Sync>),
}

impl DestinationRule {
    /// Creates a filtered rule.
    pub fn filtered(predicate: impl Fn(&Row, NodeId) -> bool + Send + Sync + 'static) -> Self {
        Self::Filtered(Arc::new(predicate))
    }

    /// Returns true if `row` should be sent to `node`.
    pub fn includes(&self, row: &Row, node: NodeId) -> bool {
        match self {
            DestinationRule::AllNodes => true,
            DestinationRule::Filtered(predicate) => predicate(row, node),
        }
    }
}

impl fmt::Debug for DestinationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationRule::AllNodes => f.write_str("AllNodes"),
            DestinationRule::Filtered(_) => f.write_str("Filtered(..)"),
        }
    }
}

/// How an incoming entity is compared to the local row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApplyPolicy {
    /// Apply whenever the incoming version differs from the local one.
    #[default]
    VersionDiffers,
    /// Apply only if the incoming row is newer (last-modified field when
    /// declared, version otherwise).
    NewerWins,
}

/// Guard deciding whether an incoming row may replace the local one.
///
/// Receives the local row (if any) and the incoming row.
pub type ReceiveGuard = Arc<dyn Fn(Option<&Row>, &Row) -> bool + Send + Sync>;

/// Receive rule applied to every incoming entity.
#[derive(Clone, Default)]
pub struct ReceiveRule {
    /// Version comparison policy.
    pub policy: ApplyPolicy,
    /// Optional extra guard preserving local invariants.
    pub guard: Option<ReceiveGuard>,
}

impl fmt::Debug for ReceiveRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveRule")
            .field("policy", &self.policy)
            .field("guard", &self.guard.is_some())
            .finish()
    }
}

/// Metadata for one replicable table.
#[derive(Debug, Clone)]
pub struct ReplicableEntity {
    /// Unique table id.
    pub table_id: TableId,
    /// Table name.
    pub table_name: String,
    /// Integer primary key field.
    pub pk_field: String,
    /// Version (etag) field.
    pub version_field: String,
    /// Optional last-modified timestamp field.
    pub last_modified_field: Option<String>,
    /// Send priority; lower values are sent first.
    pub priority: i32,
    /// Destination selection.
    pub destinations: DestinationRule,
    /// Receive rule.
    pub receive: ReceiveRule,
}

impl ReplicableEntity {
    /// Creates an entity with default priority, all-nodes destinations and
    /// the version-differs receive rule.
    pub fn new(
        table_id: TableId,
        table_name: impl Into<String>,
        pk_field: impl Into<String>,
        version_field: impl Into<String>,
    ) -> Self {
        Self {
            table_id,
            table_name: table_name.into(),
            pk_field: pk_field.into(),
            version_field: version_field.into(),
            last_modified_field: None,
            priority: 0,
            destinations: DestinationRule::AllNodes,
            receive: ReceiveRule::default(),
        }
    }

    /// Sets the send priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the last-modified field.
    #[must_use]
    pub fn with_last_modified(mut self, field: impl Into<String>) -> Self {
        self.last_modified_field = Some(field.into());
        self
    }

    /// Sets the destination rule.
    #[must_use]
    pub fn with_destinations(mut self, rule: DestinationRule) -> Self {
        self.destinations = rule;
        self
    }

    /// Sets the apply policy.
    #[must_use]
    pub fn with_apply_policy(mut self, policy: ApplyPolicy) -> Self {
        self.receive.policy = policy;
        self
    }

    /// Sets the receive guard.
    #[must_use]
    pub fn with_receive_guard(
        mut self,
        guard: impl Fn(Option<&Row>, &Row) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.receive.guard = Some(Arc::new(guard));
        self
    }

    /// The entity table definition.
    pub fn table_def(&self) -> TableDef {
        TableDef::new(&self.table_name, &self.pk_field)
    }

    /// Name of the per-destination tracker table.
    pub fn tracker_table(&self) -> String {
        format!("{}_tracker", self.table_name)
    }

    /// The tracker table definition, keyed by (entity pk, destination node).
    pub fn tracker_def(&self) -> TableDef {
        TableDef::new(self.tracker_table(), system::TRACKER_PK)
            .with_key2(system::TRACKER_DESTINATION)
    }

    /// Reads the primary key of `row`.
    pub fn pk_of(&self, row: &Row) -> CoreResult<i64> {
        row.get(&self.pk_field)
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                CoreError::invalid_entity(&self.table_name, format!("missing key {}", self.pk_field))
            })
    }

    /// Reads the row key of `row`.
    pub fn key_of(&self, row: &Row) -> CoreResult<RowKey> {
        self.pk_of(row).map(RowKey::single)
    }

    /// Reads the version of `row`.
    pub fn version_of(&self, row: &Row) -> CoreResult<Version> {
        row.get(&self.version_field)
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                CoreError::invalid_entity(
                    &self.table_name,
                    format!("missing version {}", self.version_field),
                )
            })
    }

    fn ordering_value(&self, row: &Row) -> Option<i64> {
        match &self.last_modified_field {
            Some(field) => row.get(field).and_then(Value::as_i64),
            None => row.get(&self.version_field).and_then(Value::as_i64),
        }
    }

    /// Decides whether `incoming` should replace `local`.
    ///
    /// Returns false for a silent no-op (equal version, older row, or a
    /// guard refusal).
    pub fn should_apply(&self, local: Option<&Row>, incoming: &Row) -> CoreResult<bool> {
        let incoming_version = self.version_of(incoming)?;
        if let Some(local) = local {
            let local_version = row_version(local, &self.version_field);
            if local_version == Some(incoming_version) {
                return Ok(false);
            }
            if self.receive.policy == ApplyPolicy::NewerWins
                && self.ordering_value(local) >= self.ordering_value(incoming)
            {
                return Ok(false);
            }
        }
        Ok(match &self.receive.guard {
            Some(guard) => guard(local, incoming),
            None => true,
        })
    }
}

fn row_version(row: &Row, field: &str) -> Option<Version> {
    row.get(field).and_then(Value::as_i64)
}

/// The set of replicable entities known to this node.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: Vec<ReplicableEntity>,
    by_id: HashMap<TableId, usize>,
    by_name: HashMap<String, usize>,
}

impl EntityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entity.
    ///
    /// # Errors
    ///
    /// Fails if the table id or name is already registered.
    pub fn register(&mut self, entity: ReplicableEntity) -> CoreResult<()> {
        if self.by_id.contains_key(&entity.table_id) || self.by_name.contains_key(&entity.table_name)
        {
            return Err(CoreError::invalid_operation(format!(
                "table {} ({}) registered twice",
                entity.table_name, entity.table_id
            )));
        }
        let index = self.entities.len();
        self.by_id.insert(entity.table_id, index);
        self.by_name.insert(entity.table_name.clone(), index);
        self.entities.push(entity);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, entity: ReplicableEntity) -> CoreResult<Self> {
        self.register(entity)?;
        Ok(self)
    }

    /// Looks up an entity by table id.
    pub fn by_id(&self, table_id: TableId) -> Option<&ReplicableEntity> {
        self.by_id.get(&table_id).map(|&i| &self.entities[i])
    }

    /// Looks up an entity by table id, failing if unknown.
    pub fn require(&self, table_id: TableId) -> CoreResult<&ReplicableEntity> {
        self.by_id(table_id).ok_or(CoreError::UnknownTable(table_id))
    }

    /// Looks up an entity by table name.
    pub fn by_name(&self, table_name: &str) -> Option<&ReplicableEntity> {
        self.by_name.get(table_name).map(|&i| &self.entities[i])
    }

    /// All entities in send order: priority, then table id.
    pub fn in_send_order(&self) -> Vec<&ReplicableEntity> {
        let mut entities: Vec<&ReplicableEntity> = self.entities.iter().collect();
        entities.sort_by_key(|e| (e.priority, e.table_id));
        entities
    }

    /// All entities in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ReplicableEntity> {
        self.entities.iter()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if no entity is registered.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn person() -> ReplicableEntity {
        ReplicableEntity::new(10, "Person", "personUid", "etag")
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = EntityRegistry::new();
        registry.register(person()).unwrap();
        assert!(registry.register(person()).is_err());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.by_name("Person").unwrap().table_id, 10);
    }

    #[test]
    fn send_order_uses_priority_then_id() {
        let registry = EntityRegistry::new()
            .with(ReplicableEntity::new(3, "C", "id", "v").with_priority(1))
            .unwrap()
            .with(ReplicableEntity::new(2, "B", "id", "v").with_priority(0))
            .unwrap()
            .with(ReplicableEntity::new(1, "A", "id", "v").with_priority(1))
            .unwrap();
        let order: Vec<TableId> = registry.in_send_order().iter().map(|e| e.table_id).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn version_differs_policy() {
        let entity = person();
        let local = row(json!({"personUid": 1, "etag": 5}));
        assert!(!entity
            .should_apply(Some(&local), &row(json!({"personUid": 1, "etag": 5})))
            .unwrap());
        // Older versions still apply: last write wins by arrival.
        assert!(entity
            .should_apply(Some(&local), &row(json!({"personUid": 1, "etag": 4})))
            .unwrap());
        assert!(entity
            .should_apply(None, &row(json!({"personUid": 1, "etag": 1})))
            .unwrap());
    }

    #[test]
    fn newer_wins_policy_uses_last_modified() {
        let entity = person()
            .with_last_modified("lastChanged")
            .with_apply_policy(ApplyPolicy::NewerWins);
        let local = row(json!({"personUid": 1, "etag": 5, "lastChanged": 100}));
        let older = row(json!({"personUid": 1, "etag": 6, "lastChanged": 90}));
        let newer = row(json!({"personUid": 1, "etag": 7, "lastChanged": 110}));
        assert!(!entity.should_apply(Some(&local), &older).unwrap());
        assert!(entity.should_apply(Some(&local), &newer).unwrap());
    }

    #[test]
    fn guard_can_refuse() {
        let entity = person().with_receive_guard(|_, incoming| incoming["name"] != json!("root"));
        assert!(!entity
            .should_apply(None, &row(json!({"personUid": 1, "etag": 1, "name": "root"})))
            .unwrap());
    }

    #[test]
    fn missing_version_is_invalid() {
        let err = person()
            .should_apply(None, &row(json!({"personUid": 1})))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidEntity { .. }));
    }

    #[test]
    fn filtered_destinations() {
        let entity = person().with_destinations(DestinationRule::filtered(|row, node| {
            row["owner"].as_i64() == Some(node)
        }));
        let r = row(json!({"personUid": 1, "etag": 1, "owner": 7}));
        assert!(entity.destinations.includes(&r, 7));
        assert!(!entity.destinations.includes(&r, 8));
    }
}
