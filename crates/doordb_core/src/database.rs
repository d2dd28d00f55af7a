//! The database facade wiring every replication component together.

use crate::change_tracker::ChangeTracker;
use crate::config::DatabaseConfig;
use crate::entity::EntityRegistry;
use crate::error::{CoreError, CoreResult};
use crate::keys::PrimaryKeyManager;
use crate::node::{self, DoorNode, LocalNode};
use crate::node_events::{ApplyOutcome, NodeEventManager, DEFAULT_EVENT_CAPACITY};
use crate::pool::ConnectionPool;
use crate::replication::{PendingEntity, ReplicationTracker};
use crate::subscription::Subscription;
use crate::system;
use crate::transaction::{CommitHook, CommitReport, Transaction, TransactionCoordinator};
use crate::types::{NodeId, TableId, TransactionMode};
use doordb_storage::{DataSource, Dialect};
use doordb_sync_protocol::{AckEntry, DoorMessage};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A local replicating database node.
///
/// `open` prepares the schema, loads or creates the node identity and
/// starts change tracking; everything after that goes through
/// [`with_transaction`](Self::with_transaction).
///
/// ```ignore
/// let db = DoorDatabase::open(source, registry, DatabaseConfig::default()).await?;
/// db.with_transaction(TransactionMode::ReadWrite, |txn| async move {
///     txn.insert("Person", row)?;
///     Ok::<_, CoreError>(())
/// })
/// .await?;
/// ```
pub struct DoorDatabase {
    config: DatabaseConfig,
    dialect: Dialect,
    registry: Arc<EntityRegistry>,
    coordinator: Arc<TransactionCoordinator>,
    tracker: Arc<ReplicationTracker>,
    keys: PrimaryKeyManager,
    local: LocalNode,
    events: NodeEventManager,
}

impl std::fmt::Debug for DoorDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoorDatabase")
            .field("node_id", &self.local.node_id)
            .field("dialect", &self.dialect)
            .field("entities", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl DoorDatabase {
    /// Opens a database over `source`.
    ///
    /// Must be called from within a tokio runtime: multi-writer sources get a
    /// background invalidation listener.
    ///
    /// # Errors
    ///
    /// - `Connection` if the source cannot be reached
    /// - `TriggerSetup` if persistent triggers cannot be installed
    /// - `NodeIdMismatch` if `config.node_id` differs from the stored id
    /// - `InvalidOperation` if `config.key_counter_bits` is outside `1..=62`
    pub async fn open(
        source: Arc<dyn DataSource>,
        registry: EntityRegistry,
        config: DatabaseConfig,
    ) -> CoreResult<Self> {
        PrimaryKeyManager::check_counter_bits(config.key_counter_bits)?;
        let dialect = source.dialect();
        let registry = Arc::new(registry);
        let watched = registry
            .iter()
            .map(|entity| (entity.table_id, entity.table_name.clone()))
            .collect();
        let change_tracker = Arc::new(ChangeTracker::new(
            dialect,
            watched,
            config.invalidation_channel.clone(),
        ));

        {
            let mut conn = source
                .connect()
                .map_err(|e| CoreError::connection(e.to_string()))?;
            for table in system::system_tables() {
                conn.create_table(&table)?;
            }
            for entity in registry.iter() {
                conn.create_table(&entity.table_def())?;
                conn.create_table(&entity.tracker_def())?;
            }
            change_tracker.install_persistent(&mut *conn)?;
        }

        let pool = ConnectionPool::new(Arc::clone(&source), config.pool_size, config.acquire_timeout);
        let coordinator = Arc::new(TransactionCoordinator::new(
            dialect,
            pool,
            Arc::clone(&change_tracker),
            config.transaction_timeout,
        ));
        let tracker = Arc::new(ReplicationTracker::new(Arc::clone(&registry)));
        coordinator.add_hook(Arc::clone(&tracker) as Arc<dyn CommitHook>);

        let configured = config.node_id;
        let max_node_id = PrimaryKeyManager::max_node_id(config.key_counter_bits);
        let local = coordinator
            .with_transaction(TransactionMode::ReadWrite, move |txn| async move {
                node::load_or_create_local(&txn, configured, max_node_id)
            })
            .await?;

        let keys = PrimaryKeyManager::new(local.node_id, config.key_counter_bits)?;
        let seed_registry = Arc::clone(&registry);
        let existing = coordinator
            .with_transaction(TransactionMode::ReadOnly, move |txn| async move {
                let mut existing = Vec::new();
                for entity in seed_registry.iter() {
                    for (key, _) in txn.scan(&entity.table_name, |_| true)? {
                        existing.push((entity.table_id, key.key1));
                    }
                }
                Ok::<_, CoreError>(existing)
            })
            .await?;
        for (table_id, key) in existing {
            keys.observe_existing(table_id, key);
        }

        change_tracker.start_listener(source, config.listener_retry);

        let events = NodeEventManager::new(
            local.node_id,
            Arc::clone(&coordinator),
            Arc::clone(&registry),
            Arc::clone(&tracker),
            DEFAULT_EVENT_CAPACITY,
        );

        tracing::info!(
            node_id = local.node_id,
            dialect = dialect.name(),
            entities = registry.len(),
            "database opened"
        );
        Ok(Self {
            config,
            dialect,
            registry,
            coordinator,
            tracker,
            keys,
            local,
            events,
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.local.node_id
    }

    /// This node's identity, including its auth token.
    pub fn local_node(&self) -> &LocalNode {
        &self.local
    }

    /// Storage dialect of the underlying source.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Configuration the database was opened with.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// The entity registry.
    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// The transaction coordinator.
    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    /// The replication tracker.
    pub fn tracker(&self) -> &Arc<ReplicationTracker> {
        &self.tracker
    }

    /// The node event manager.
    pub fn events(&self) -> &NodeEventManager {
        &self.events
    }

    /// The primary key manager.
    pub fn keys(&self) -> &PrimaryKeyManager {
        &self.keys
    }

    /// Runs `block` in a new top-level transaction.
    ///
    /// See [`TransactionCoordinator::with_transaction`].
    pub async fn with_transaction<R, E, F, Fut>(&self, mode: TransactionMode, block: F) -> Result<R, E>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<CoreError>,
    {
        self.coordinator.with_transaction(mode, block).await
    }

    /// Calls `callback` with the changed tables of interest after each
    /// commit touching at least one of `tables`.
    pub fn observe<I, S>(
        &self,
        tables: I,
        callback: impl Fn(&BTreeSet<String>) + Send + Sync + 'static,
    ) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.coordinator.change_tracker().observe(tables, callback)
    }

    /// Channel form of [`observe`](Self::observe).
    pub fn observe_channel<I, S>(
        &self,
        tables: I,
    ) -> (Subscription, mpsc::UnboundedReceiver<BTreeSet<String>>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.coordinator.change_tracker().observe_channel(tables)
    }

    /// Registers a callback run after every read-write commit.
    pub fn on_commit(&self, callback: impl Fn(&CommitReport) + Send + Sync + 'static) -> Subscription {
        self.coordinator.on_commit(callback)
    }

    /// Registers (or re-keys) a remote node.
    ///
    /// A node seen for the first time gets tracker rows for every row that
    /// currently qualifies for it. Returns the number of rows seeded, 0 for
    /// an already known node.
    pub async fn register_node(&self, node_id: NodeId, auth: impl Into<String>) -> CoreResult<usize> {
        if node_id == self.local.node_id {
            return Err(CoreError::invalid_operation(format!(
                "cannot register local node {node_id} as a remote node"
            )));
        }
        let door_node = DoorNode::new(node_id, auth);
        let tracker = Arc::clone(&self.tracker);
        let seeded = self
            .coordinator
            .with_transaction(TransactionMode::ReadWrite, move |txn| async move {
                if node::put_node(&txn, &door_node)? {
                    tracker.seed_node(&txn, door_node.node_id)
                } else {
                    Ok(0)
                }
            })
            .await?;
        tracing::info!(node_id, seeded, "node registered");
        Ok(seeded)
    }

    /// Removes a remote node and all of its tracker rows.
    ///
    /// Returns the number of tracker rows deleted.
    pub async fn deregister_node(&self, node_id: NodeId) -> CoreResult<usize> {
        let tracker = Arc::clone(&self.tracker);
        let removed = self
            .coordinator
            .with_transaction(TransactionMode::ReadWrite, move |txn| async move {
                node::delete_node(&txn, node_id)?;
                tracker.remove_node(&txn, node_id)
            })
            .await?;
        tracing::info!(node_id, removed, "node deregistered");
        Ok(removed)
    }

    /// Looks up a remote node.
    pub async fn node(&self, node_id: NodeId) -> CoreResult<Option<DoorNode>> {
        self.coordinator
            .with_transaction(TransactionMode::ReadOnly, move |txn| async move {
                node::get_node(&txn, node_id)
            })
            .await
    }

    /// All remote nodes.
    pub async fn nodes(&self) -> CoreResult<Vec<DoorNode>> {
        self.coordinator
            .with_transaction(TransactionMode::ReadOnly, |txn| async move {
                node::list_nodes(&txn)
            })
            .await
    }

    /// Rows pending for `node`, in send order, at most `limit`.
    pub async fn pending_for_node(
        &self,
        node: NodeId,
        table_id: Option<TableId>,
        limit: usize,
    ) -> CoreResult<Vec<PendingEntity>> {
        let tracker = Arc::clone(&self.tracker);
        self.coordinator
            .with_transaction(TransactionMode::ReadOnly, move |txn| async move {
                tracker.pending_for_node(&txn, node, table_id, limit)
            })
            .await
    }

    /// Applies acknowledgements received from `node`.
    pub async fn acknowledge(&self, node: NodeId, acks: Vec<AckEntry>) -> CoreResult<usize> {
        self.events.acknowledge(node, acks).await
    }

    /// Applies a message received from another node.
    pub async fn apply_incoming(&self, message: DoorMessage) -> CoreResult<ApplyOutcome> {
        self.events.on_incoming_message(message).await
    }

    /// Allocates a primary key for a new row of `table_id`.
    pub fn next_key(&self, table_id: TableId) -> CoreResult<i64> {
        self.registry.require(table_id)?;
        self.keys.next_key(table_id)
    }

    /// Forces row `pk` of `table_id` to be sent to `destination` when `txn`
    /// commits.
    pub fn queue_outgoing(
        &self,
        txn: &Transaction,
        destination: NodeId,
        table_id: TableId,
        pk: i64,
    ) -> CoreResult<()> {
        self.tracker.queue_outgoing(txn, destination, table_id, pk)
    }

    /// Shuts the database down.
    ///
    /// Event streams end, new transactions fail with `Closed` and open ones
    /// are rolled back. Returns the number of transactions that were still
    /// open.
    pub fn close(&self) -> usize {
        self.events.close();
        let leaked = self.coordinator.close();
        tracing::info!(node_id = self.local.node_id, leaked, "database closed");
        leaked
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        self.coordinator.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerRetry;
    use crate::entity::ReplicableEntity;
    use doordb_storage::{MemoryDataSource, Row};
    use doordb_sync_protocol::MessageKind;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const PERSON: TableId = 1;
    const COURSE: TableId = 2;

    fn registry() -> EntityRegistry {
        EntityRegistry::new()
            .with(ReplicableEntity::new(PERSON, "Person", "personUid", "etag").with_priority(2))
            .unwrap()
            .with(ReplicableEntity::new(COURSE, "Course", "courseUid", "etag").with_priority(1))
            .unwrap()
    }

    fn row(value: Value) -> Row {
        value.as_object().unwrap().clone()
    }

    async fn open_with(source: &MemoryDataSource, config: DatabaseConfig) -> DoorDatabase {
        DoorDatabase::open(Arc::new(source.clone()), registry(), config)
            .await
            .unwrap()
    }

    async fn open(source: &MemoryDataSource, node_id: NodeId) -> DoorDatabase {
        open_with(source, DatabaseConfig::new().with_node_id(node_id)).await
    }

    async fn put_person(db: &DoorDatabase, pk: i64, etag: i64) {
        db.with_transaction(TransactionMode::ReadWrite, |txn| async move {
            txn.upsert("Person", row(json!({"personUid": pk, "etag": etag, "name": "Ada"})))?;
            Ok::<_, CoreError>(())
        })
        .await
        .unwrap();
    }

    async fn put_course(db: &DoorDatabase, pk: i64, etag: i64) {
        db.with_transaction(TransactionMode::ReadWrite, |txn| async move {
            txn.upsert("Course", row(json!({"courseUid": pk, "etag": etag})))?;
            Ok::<_, CoreError>(())
        })
        .await
        .unwrap();
    }

    /// Person rows go only to the node named in their `owner` field.
    async fn open_owned(source: &MemoryDataSource) -> DoorDatabase {
        let registry = EntityRegistry::new()
            .with(
                ReplicableEntity::new(PERSON, "Person", "personUid", "etag").with_destinations(
                    crate::entity::DestinationRule::filtered(|row, node| {
                        row.get("owner").and_then(Value::as_i64) == Some(node)
                    }),
                ),
            )
            .unwrap();
        DoorDatabase::open(
            Arc::new(source.clone()),
            registry,
            DatabaseConfig::new().with_node_id(1),
        )
        .await
        .unwrap()
    }

    fn ack(table_id: TableId, key1: i64, version: i64) -> AckEntry {
        AckEntry {
            table_id,
            key1,
            key2: 0,
            version,
        }
    }

    #[tokio::test]
    async fn identity_is_generated_once_and_immutable() {
        let source = MemoryDataSource::single_writer();
        let db = open_with(&source, DatabaseConfig::new()).await;
        let node_id = db.node_id();
        let token = db.local_node().auth_token.clone();
        assert!(node_id >= 1);
        db.close();

        let reopened = open_with(&source, DatabaseConfig::new()).await;
        assert_eq!(reopened.node_id(), node_id);
        assert_eq!(reopened.local_node().auth_token, token);
        reopened.close();

        let err = DoorDatabase::open(
            Arc::new(source.clone()),
            registry(),
            DatabaseConfig::new().with_node_id(node_id % 1000 + 1001),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::NodeIdMismatch { stored, .. } if stored == node_id));
    }

    #[tokio::test]
    async fn writes_mark_rows_pending_for_each_node() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 1).await;
        db.register_node(10, "a").await.unwrap();
        db.register_node(11, "b").await.unwrap();

        put_person(&db, 5, 1).await;

        for node in [10, 11] {
            let pending = db.pending_for_node(node, None, 10).await.unwrap();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].pk, 5);
            assert_eq!(pending[0].version, 1);
        }
        assert_eq!(source.row_count("Person_tracker"), 2);
    }

    #[tokio::test]
    async fn unchanged_version_is_not_marked_again() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 1).await;
        db.register_node(10, "a").await.unwrap();
        let mut events = db.events().subscribe_outgoing().unwrap();

        put_person(&db, 5, 1).await;
        assert_eq!(events.try_recv().unwrap().len(), 1);

        put_person(&db, 5, 1).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn registering_a_node_seeds_existing_rows() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 1).await;
        for pk in 1..=3 {
            put_person(&db, pk, 1).await;
        }
        put_course(&db, 1, 1).await;
        put_course(&db, 2, 1).await;

        assert_eq!(db.register_node(10, "a").await.unwrap(), 5);
        assert_eq!(db.pending_for_node(10, None, 100).await.unwrap().len(), 5);

        // Already known: nothing seeded twice.
        assert_eq!(db.register_node(10, "a2").await.unwrap(), 0);
        assert_eq!(db.node(10).await.unwrap().unwrap().auth, "a2");
    }

    #[tokio::test]
    async fn filtered_destinations_only_receive_matching_rows() {
        let source = MemoryDataSource::single_writer();
        let db = open_owned(&source).await;
        db.register_node(10, "a").await.unwrap();
        db.register_node(11, "b").await.unwrap();

        db.with_transaction(TransactionMode::ReadWrite, |txn| async move {
            txn.insert("Person", row(json!({"personUid": 1, "etag": 1, "owner": 10})))?;
            Ok::<_, CoreError>(())
        })
        .await
        .unwrap();

        assert_eq!(db.pending_for_node(10, None, 10).await.unwrap().len(), 1);
        assert!(db.pending_for_node(11, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_rows_follow_send_priority() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 1).await;
        db.register_node(10, "a").await.unwrap();
        put_person(&db, 1, 1).await;
        put_course(&db, 7, 1).await;
        put_person(&db, 2, 1).await;

        let order: Vec<(TableId, i64)> = db
            .pending_for_node(10, None, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|p| (p.table_id, p.pk))
            .collect();
        assert_eq!(order, vec![(COURSE, 7), (PERSON, 1), (PERSON, 2)]);

        let tables = db.events().pending_tables(10).await.unwrap();
        assert_eq!(tables, vec![COURSE, PERSON]);
    }

    #[tokio::test]
    async fn stale_ack_leaves_row_pending() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 1).await;
        db.register_node(10, "a").await.unwrap();
        put_person(&db, 5, 1).await;
        put_person(&db, 5, 2).await;

        assert_eq!(db.acknowledge(10, vec![ack(PERSON, 5, 1)]).await.unwrap(), 0);
        assert_eq!(db.pending_for_node(10, None, 10).await.unwrap().len(), 1);

        assert_eq!(db.acknowledge(10, vec![ack(PERSON, 5, 2)]).await.unwrap(), 1);
        assert!(db.pending_for_node(10, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn incoming_apply_is_idempotent_and_not_echoed() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 1).await;
        db.register_node(10, "a").await.unwrap();
        db.register_node(11, "b").await.unwrap();
        let mut outgoing = db.events().subscribe_outgoing().unwrap();
        let mut incoming = db.events().subscribe_incoming().unwrap();

        let message = DoorMessage::new(MessageKind::Push, 10, 1)
            .with_entity(PERSON, row(json!({"personUid": 9, "etag": 4})));

        let first = db.apply_incoming(message.clone()).await.unwrap();
        assert_eq!(first.applied, 1);
        assert_eq!(first.acks, vec![ack(PERSON, 9, 4)]);
        assert_eq!(incoming.try_recv().unwrap().as_ref(), &message);

        let second = db.apply_incoming(message).await.unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(source.row_count("Person"), 1);

        // Relayed to node 11, never back to the sender.
        let events = outgoing.try_recv().unwrap();
        assert!(events.iter().all(|e| e.to_node == 11));
        assert!(db.pending_for_node(10, None, 10).await.unwrap().is_empty());
        assert_eq!(db.pending_for_node(11, None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_apply_writes_nothing() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 1).await;
        let message = DoorMessage::new(MessageKind::Push, 10, 1)
            .with_entity(PERSON, row(json!({"personUid": 9, "etag": 4})))
            .with_entity(99, row(json!({"id": 1})));

        let err = db.apply_incoming(message).await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownTable(99)));
        assert_eq!(source.row_count("Person"), 0);
    }

    #[tokio::test]
    async fn message_for_another_node_is_rejected() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 1).await;
        let message = DoorMessage::new(MessageKind::Push, 10, 2);
        assert!(matches!(
            db.apply_incoming(message).await,
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[tokio::test]
    async fn round_trip_between_two_nodes() {
        let source1 = MemoryDataSource::single_writer();
        let source2 = MemoryDataSource::single_writer();
        let db1 = open(&source1, 1).await;
        let db2 = open(&source2, 2).await;
        db1.register_node(2, "t2").await.unwrap();
        db2.register_node(1, "t1").await.unwrap();

        put_person(&db1, 42, 3).await;

        let batch = db1
            .events()
            .pending_batch(2, None, 10, MessageKind::Push)
            .await
            .unwrap();
        assert!(!batch.has_more);
        let outcome = db2.apply_incoming(batch.message).await.unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(db1.acknowledge(2, outcome.acks).await.unwrap(), 1);

        assert!(db1.pending_for_node(2, None, 10).await.unwrap().is_empty());
        assert!(db2.pending_for_node(1, None, 10).await.unwrap().is_empty());
        let rows = source2.rows("Person");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&json!("Ada")));
    }

    #[tokio::test]
    async fn pending_batch_reports_more() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 1).await;
        db.register_node(10, "a").await.unwrap();
        for pk in 1..=3 {
            put_person(&db, pk, 1).await;
        }
        let batch = db
            .events()
            .pending_batch(10, Some(PERSON), 2, MessageKind::Pull)
            .await
            .unwrap();
        assert!(batch.has_more);
        assert_eq!(batch.message.replications.len(), 2);
        assert_eq!(batch.acks.len(), 2);

        let rest = db
            .events()
            .pending_batch(10, Some(PERSON), 3, MessageKind::Pull)
            .await
            .unwrap();
        assert!(!rest.has_more);
    }

    #[tokio::test]
    async fn observers_only_see_their_tables() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 1).await;
        let (_people, mut people_rx) = db.observe_channel(["Person"]);
        let (_courses, mut courses_rx) = db.observe_channel(["Course"]);

        put_person(&db, 1, 1).await;

        assert_eq!(
            people_rx.try_recv().unwrap(),
            BTreeSet::from(["Person".to_string()])
        );
        assert!(courses_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalidation_follows_commit_only() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 1).await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let _sub = db.observe(["Person"], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = db
            .with_transaction(TransactionMode::ReadWrite, |txn| async move {
                txn.insert("Person", row(json!({"personUid": 1, "etag": 1})))?;
                Err::<(), _>(CoreError::invalid_operation("abort"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(source.row_count("Person"), 0);

        let inside = Arc::clone(&seen);
        let seen_before_commit = db
            .with_transaction(TransactionMode::ReadWrite, |txn| async move {
                txn.insert("Person", row(json!({"personUid": 1, "etag": 1})))?;
                Ok::<_, CoreError>(inside.load(Ordering::SeqCst))
            })
            .await
            .unwrap();
        assert_eq!(seen_before_commit, 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 1).await;
        let (sub, mut rx) = db.observe_channel(["Person"]);
        drop(sub);
        put_person(&db, 1, 1).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_writer_transactions_never_interleave() {
        let source = MemoryDataSource::single_writer();
        let db = Arc::new(open(&source, 1).await);
        source.enable_statement_log();

        let mut tasks = Vec::new();
        for pk in 1..=4 {
            let db = Arc::clone(&db);
            tasks.push(tokio::spawn(async move {
                db.with_transaction(TransactionMode::ReadWrite, |txn| async move {
                    txn.insert("Person", row(json!({"personUid": pk, "etag": 1})))?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    txn.insert("Course", row(json!({"courseUid": pk, "etag": 1})))?;
                    Ok::<_, CoreError>(())
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let boundaries: Vec<String> = source
            .statement_log()
            .into_iter()
            .map(|r| r.statement)
            .filter(|s| s == "BEGIN" || s == "COMMIT")
            .collect();
        assert_eq!(boundaries.len(), 8);
        for pair in boundaries.chunks(2) {
            assert_eq!(pair, ["BEGIN", "COMMIT"]);
        }
    }

    #[tokio::test]
    async fn timeout_cancels_block_and_releases_connection() {
        let source = MemoryDataSource::single_writer();
        let db = open_with(
            &source,
            DatabaseConfig::new()
                .with_node_id(1)
                .with_transaction_timeout(Some(Duration::from_millis(50))),
        )
        .await;

        let err = db
            .with_transaction(TransactionMode::ReadWrite, |txn| async move {
                txn.insert("Person", row(json!({"personUid": 1, "etag": 1})))?;
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, CoreError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::TransactionTimeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(source.row_count("Person"), 0);
        let pool = db.coordinator().pool();
        assert_eq!(pool.available(), pool.size());
        assert!(db.coordinator().open_transactions().is_empty());

        // The writer lock was released too.
        put_person(&db, 2, 1).await;
    }

    #[tokio::test]
    async fn deregistering_removes_tracker_rows() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 1).await;
        db.register_node(10, "a").await.unwrap();
        db.register_node(11, "b").await.unwrap();
        put_person(&db, 1, 1).await;
        put_person(&db, 2, 1).await;

        assert_eq!(db.deregister_node(10).await.unwrap(), 2);
        assert!(db.node(10).await.unwrap().is_none());
        assert_eq!(db.nodes().await.unwrap().len(), 1);
        assert_eq!(source.row_count("Person_tracker"), 2);
    }

    #[tokio::test]
    async fn queued_outgoing_forces_a_resend() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 1).await;
        db.register_node(10, "a").await.unwrap();
        put_person(&db, 5, 1).await;
        db.acknowledge(10, vec![ack(PERSON, 5, 1)]).await.unwrap();
        let mut outgoing = db.events().subscribe_outgoing().unwrap();

        db.with_transaction(TransactionMode::ReadWrite, |txn| {
            let result = db.queue_outgoing(&txn, 10, PERSON, 5);
            async move { result }
        })
        .await
        .unwrap();

        let events = outgoing.try_recv().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!((events[0].to_node, events[0].key1), (10, 5));
        assert_eq!(db.pending_for_node(10, None, 10).await.unwrap().len(), 1);
        assert_eq!(source.row_count(system::OUTGOING_TABLE), 0);
    }

    #[tokio::test]
    async fn one_event_batch_per_commit() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 1).await;
        db.register_node(10, "a").await.unwrap();
        db.register_node(11, "b").await.unwrap();
        let mut outgoing = db.events().subscribe_outgoing().unwrap();

        db.with_transaction(TransactionMode::ReadWrite, |txn| async move {
            txn.insert("Person", row(json!({"personUid": 1, "etag": 1})))?;
            txn.insert("Person", row(json!({"personUid": 2, "etag": 1})))?;
            txn.upsert("Person", row(json!({"personUid": 2, "etag": 2})))?;
            Ok::<_, CoreError>(())
        })
        .await
        .unwrap();

        let events = outgoing.try_recv().unwrap();
        assert_eq!(events.len(), 4);
        assert!(outgoing.try_recv().is_err());
    }

    #[tokio::test]
    async fn keys_continue_after_existing_rows() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 7).await;
        let first = db.next_key(PERSON).unwrap();
        assert!(db.keys().owns(first));
        put_person(&db, first + 4, 1).await;
        db.close();

        let reopened = open(&source, 7).await;
        assert_eq!(reopened.next_key(PERSON).unwrap(), first + 5);
        assert!(matches!(
            reopened.next_key(99),
            Err(CoreError::UnknownTable(99))
        ));
    }

    #[tokio::test]
    async fn closed_database_fails_fast() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 1).await;
        assert_eq!(db.close(), 0);
        assert!(db.is_closed());
        assert!(matches!(db.nodes().await, Err(CoreError::Closed)));
        assert!(matches!(
            db.events().subscribe_outgoing(),
            Err(CoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn multi_writer_invalidations_arrive_through_listener() {
        let source = MemoryDataSource::multi_writer();
        let db = open_with(
            &source,
            DatabaseConfig::new()
                .with_node_id(1)
                .with_listener_retry(ListenerRetry {
                    initial_delay: Duration::from_millis(5),
                    max_delay: Duration::from_millis(20),
                }),
        )
        .await;
        let mut triggers = source.persistent_triggers();
        triggers.sort();
        assert_eq!(triggers, vec!["door_inv_Course", "door_inv_Person"]);
        let (_sub, mut rx) = db.observe_channel(["Person"]);
        while source.listener_count("doorinvalidations") == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        put_person(&db, 1, 1).await;
        let changed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(changed, BTreeSet::from(["Person".to_string()]));

        // After a lost listener every watched table is reported once.
        source.disconnect_listeners();
        let changed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(changed, BTreeSet::from(["Person".to_string()]));
    }

    #[tokio::test]
    async fn rows_leaving_a_destination_are_withdrawn() {
        let source = MemoryDataSource::single_writer();
        let db = open_owned(&source).await;
        db.register_node(10, "a").await.unwrap();
        db.register_node(11, "b").await.unwrap();

        for (etag, owner) in [(1, 10), (2, 11)] {
            db.with_transaction(TransactionMode::ReadWrite, |txn| async move {
                txn.upsert(
                    "Person",
                    row(json!({"personUid": 1, "etag": etag, "owner": owner})),
                )?;
                Ok::<_, CoreError>(())
            })
            .await
            .unwrap();
        }

        let tracker = Arc::clone(db.tracker());
        let tables = db
            .with_transaction(TransactionMode::ReadOnly, |txn| async move {
                tracker.pending_tables(&txn, 10)
            })
            .await
            .unwrap();
        assert!(tables.is_empty());
        assert!(db.pending_for_node(10, None, 10).await.unwrap().is_empty());
        let pending = db.pending_for_node(11, None, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].version, 2);
        assert_eq!(source.row_count("Person_tracker"), 1);
    }

    #[tokio::test]
    async fn ack_racing_a_newer_version_leaves_it_pending() {
        let source = MemoryDataSource::multi_writer();
        let db = Arc::new(open(&source, 1).await);
        db.register_node(10, "a").await.unwrap();
        put_person(&db, 5, 1).await;

        let (acked_tx, acked_rx) = tokio::sync::oneshot::channel::<()>();
        let (written_tx, written_rx) = tokio::sync::oneshot::channel::<()>();
        let writer = {
            let db = Arc::clone(&db);
            tokio::spawn(async move {
                acked_rx.await.unwrap();
                put_person(&db, 5, 2).await;
                written_tx.send(()).unwrap();
            })
        };

        // The ack reads version 1 and commits after version 2 was marked.
        let tracker = Arc::clone(db.tracker());
        db.with_transaction(TransactionMode::ReadWrite, |txn| async move {
            let cleared = tracker.acknowledge(&txn, 10, &[ack(PERSON, 5, 1)])?;
            assert_eq!(cleared, 1);
            acked_tx.send(()).unwrap();
            written_rx.await.unwrap();
            Ok::<_, CoreError>(())
        })
        .await
        .unwrap();
        writer.await.unwrap();

        let pending = db.pending_for_node(10, None, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].version, 2);
    }

    #[tokio::test]
    async fn open_rejects_unusable_key_counter_bits() {
        let source = MemoryDataSource::single_writer();
        for bits in [0, 63, 64] {
            let result = DoorDatabase::open(
                Arc::new(source.clone()),
                registry(),
                DatabaseConfig::new()
                    .with_node_id(1)
                    .with_key_counter_bits(bits),
            )
            .await;
            assert!(
                matches!(result, Err(CoreError::InvalidOperation { .. })),
                "bits = {bits}"
            );
        }
    }

    #[tokio::test]
    async fn calls_inside_a_transaction_join_it() {
        let source = MemoryDataSource::single_writer();
        let db = open_with(
            &source,
            DatabaseConfig::new()
                .with_node_id(1)
                .with_transaction_timeout(Some(Duration::from_secs(2))),
        )
        .await;
        put_person(&db, 1, 1).await;
        source.enable_statement_log();

        let outer = &db;
        let seeded = db
            .with_transaction(TransactionMode::ReadWrite, |txn| async move {
                txn.insert("Course", row(json!({"courseUid": 1, "etag": 1})))?;
                outer.register_node(10, "a").await
            })
            .await
            .unwrap();
        let begins = source
            .statement_log()
            .into_iter()
            .filter(|r| r.statement == "BEGIN")
            .count();

        // The nested call saw the staged course and shared the outer BEGIN.
        assert_eq!(seeded, 2);
        assert_eq!(begins, 1);
        assert!(db.node(10).await.unwrap().is_some());
        assert_eq!(db.pending_for_node(10, None, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn trigger_setup_failure_aborts_the_transaction() {
        let source = MemoryDataSource::single_writer();
        let db = open(&source, 1).await;
        source.fail_trigger_installs(true);

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let err = db
            .with_transaction(TransactionMode::ReadWrite, |txn| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                txn.insert("Person", row(json!({"personUid": 1, "etag": 1})))?;
                Ok::<_, CoreError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::TriggerSetup { .. }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(source.row_count("Person"), 0);
        let pool = db.coordinator().pool();
        assert_eq!(pool.available(), pool.size());
        assert!(db.coordinator().open_transactions().is_empty());

        source.fail_trigger_installs(false);
        put_person(&db, 1, 1).await;
        assert_eq!(source.row_count("Person"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn multi_writer_concurrency_is_bounded_by_the_pool() {
        let source = MemoryDataSource::multi_writer();
        let db = Arc::new(
            open_with(
                &source,
                DatabaseConfig::new()
                    .with_node_id(1)
                    .with_pool_size(2)
                    .with_acquire_timeout(Duration::from_millis(100)),
            )
            .await,
        );

        let inside = Arc::new(tokio::sync::Barrier::new(3));
        let gate = Arc::new(tokio::sync::RwLock::new(()));
        let hold = gate.write().await;

        let mut tasks = Vec::new();
        for pk in 1..=2 {
            let db = Arc::clone(&db);
            let inside = Arc::clone(&inside);
            let gate = Arc::clone(&gate);
            tasks.push(tokio::spawn(async move {
                db.with_transaction(TransactionMode::ReadWrite, |txn| async move {
                    txn.insert("Person", row(json!({"personUid": pk, "etag": 1})))?;
                    inside.wait().await;
                    drop(gate.read().await);
                    Ok::<_, CoreError>(())
                })
                .await
            }));
        }

        // Both transactions are open at once.
        inside.wait().await;
        assert_eq!(db.coordinator().open_transactions().len(), 2);
        assert_eq!(db.coordinator().pool().available(), 0);

        // A third one cannot get a connection while they hold both.
        let err = db
            .with_transaction(TransactionMode::ReadWrite, |_txn| async move {
                Ok::<_, CoreError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Connection { .. }));

        drop(hold);
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        put_person(&db, 3, 1).await;
        assert_eq!(source.row_count("Person"), 3);
    }

    #[tokio::test]
    async fn multi_writer_commit_reaches_observers_once() {
        let source = MemoryDataSource::multi_writer();
        let db = open(&source, 1).await;
        let (_sub, mut rx) = db.observe_channel(["Person", "Course"]);
        while source.listener_count("doorinvalidations") == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        db.with_transaction(TransactionMode::ReadWrite, |txn| async move {
            txn.insert("Person", row(json!({"personUid": 1, "etag": 1})))?;
            txn.insert("Course", row(json!({"courseUid": 1, "etag": 1})))?;
            Ok::<_, CoreError>(())
        })
        .await
        .unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            changed,
            BTreeSet::from(["Course".to_string(), "Person".to_string()])
        );
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err());
    }
}
