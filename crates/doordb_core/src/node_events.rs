//! Node event manager: the bridge between local commits and the transport.
//!
//! Outgoing: every read-write commit whose replication hook produced events
//! is broadcast once as a batch of [`NodeEvent`]s.
//!
//! Incoming: a [`DoorMessage`] is applied in one transaction through each
//! entity's receive rule, then re-broadcast on the incoming stream.

use crate::entity::EntityRegistry;
use crate::error::{CoreError, CoreResult};
use crate::replication::ReplicationTracker;
use crate::subscription::Subscription;
use crate::transaction::TransactionCoordinator;
use crate::types::{NodeId, TableId, TransactionMode};
use doordb_sync_protocol::{AckEntry, DoorMessage, MessageKind, NodeEvent};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default capacity of the outgoing and incoming broadcast channels.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Result of applying an incoming message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Entities written.
    pub applied: usize,
    /// Entities skipped by the receive rule (equal version, older, guarded).
    pub skipped: usize,
    /// Versions received, to acknowledge to the sender.
    pub acks: Vec<AckEntry>,
}

/// A batch of entities pending for a node.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBatch {
    /// The entities as a message from this node.
    pub message: DoorMessage,
    /// The tracker versions of the entities, in message order.
    pub acks: Vec<AckEntry>,
    /// True if more pending entities remain.
    pub has_more: bool,
}

/// Outgoing and incoming node event streams.
pub struct NodeEventManager {
    local_node: NodeId,
    coordinator: Arc<TransactionCoordinator>,
    registry: Arc<EntityRegistry>,
    tracker: Arc<ReplicationTracker>,
    outgoing: Mutex<Option<broadcast::Sender<Arc<Vec<NodeEvent>>>>>,
    incoming: Mutex<Option<broadcast::Sender<Arc<DoorMessage>>>>,
    commit_subscription: Mutex<Option<Subscription>>,
    closed: AtomicBool,
}

impl NodeEventManager {
    /// Creates a manager and hooks it to the coordinator's commits.
    pub fn new(
        local_node: NodeId,
        coordinator: Arc<TransactionCoordinator>,
        registry: Arc<EntityRegistry>,
        tracker: Arc<ReplicationTracker>,
        capacity: usize,
    ) -> Self {
        let (outgoing, _) = broadcast::channel(capacity.max(1));
        let (incoming, _) = broadcast::channel(capacity.max(1));
        let sender = outgoing.clone();
        let commit_subscription = coordinator.on_commit(move |report| {
            if !report.node_events.is_empty() {
                // No subscribers is fine: trackers keep the rows pending.
                let _ = sender.send(Arc::new(report.node_events.clone()));
            }
        });
        Self {
            local_node,
            coordinator,
            registry,
            tracker,
            outgoing: Mutex::new(Some(outgoing)),
            incoming: Mutex::new(Some(incoming)),
            commit_subscription: Mutex::new(Some(commit_subscription)),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// This node's id.
    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// Subscribes to outgoing event batches (one per qualifying commit).
    pub fn subscribe_outgoing(&self) -> CoreResult<broadcast::Receiver<Arc<Vec<NodeEvent>>>> {
        self.ensure_open()?;
        self.outgoing
            .lock()
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or(CoreError::Closed)
    }

    /// Subscribes to successfully applied incoming messages.
    pub fn subscribe_incoming(&self) -> CoreResult<broadcast::Receiver<Arc<DoorMessage>>> {
        self.ensure_open()?;
        self.incoming
            .lock()
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or(CoreError::Closed)
    }

    /// Applies `message` atomically.
    ///
    /// Every entity goes through its receive rule; entities the rule refuses
    /// are skipped without error. Written rows are attributed to the sending
    /// node so they are not replicated back to it. If any entity fails
    /// (unknown table, missing key), nothing is applied.
    pub async fn on_incoming_message(&self, message: DoorMessage) -> CoreResult<ApplyOutcome> {
        self.ensure_open()?;
        if message.to_node != self.local_node {
            return Err(CoreError::invalid_operation(format!(
                "message for node {} delivered to node {}",
                message.to_node, self.local_node
            )));
        }
        let registry = Arc::clone(&self.registry);
        let incoming = self.incoming.lock().clone();
        let from = message.from_node;

        let outcome = self
            .coordinator
            .with_transaction(TransactionMode::ReadWrite, move |txn| async move {
                let mut outcome = ApplyOutcome::default();
                for replication in &message.replications {
                    let entity = registry.require(replication.table_id)?;
                    let key = entity.key_of(&replication.entity)?;
                    let version = entity.version_of(&replication.entity)?;
                    let local = txn.get(&entity.table_name, key)?;
                    if entity.should_apply(local.as_ref(), &replication.entity)? {
                        txn.upsert(&entity.table_name, replication.entity.clone())?;
                        txn.record_origin(&entity.table_name, key, from);
                        outcome.applied += 1;
                    } else {
                        outcome.skipped += 1;
                    }
                    outcome.acks.push(AckEntry {
                        table_id: entity.table_id,
                        key1: key.key1,
                        key2: 0,
                        version,
                    });
                }
                // Re-emitted once the outermost transaction commits.
                if let Some(incoming) = incoming {
                    let message = Arc::new(message);
                    txn.defer(move || {
                        let _ = incoming.send(message);
                    });
                }
                Ok::<_, CoreError>(outcome)
            })
            .await?;

        tracing::debug!(
            from,
            applied = outcome.applied,
            skipped = outcome.skipped,
            "incoming message applied"
        );
        Ok(outcome)
    }

    /// Collects up to `limit` pending entities for `to_node`.
    pub async fn pending_batch(
        &self,
        to_node: NodeId,
        table_id: Option<TableId>,
        limit: usize,
        what: MessageKind,
    ) -> CoreResult<PendingBatch> {
        self.ensure_open()?;
        let tracker = Arc::clone(&self.tracker);
        let local = self.local_node;
        self.coordinator
            .with_transaction(TransactionMode::ReadOnly, move |txn| async move {
                let mut pending =
                    tracker.pending_for_node(&txn, to_node, table_id, limit.saturating_add(1))?;
                let has_more = pending.len() > limit;
                pending.truncate(limit);

                let mut message = DoorMessage::new(what, local, to_node);
                let mut acks = Vec::with_capacity(pending.len());
                for entity in pending {
                    acks.push(AckEntry {
                        table_id: entity.table_id,
                        key1: entity.pk,
                        key2: 0,
                        version: entity.version,
                    });
                    message = message.with_entity(entity.table_id, entity.row);
                }
                Ok(PendingBatch {
                    message,
                    acks,
                    has_more,
                })
            })
            .await
    }

    /// Tables with pending rows for `node`, in send order.
    pub async fn pending_tables(&self, node: NodeId) -> CoreResult<Vec<TableId>> {
        self.ensure_open()?;
        let tracker = Arc::clone(&self.tracker);
        self.coordinator
            .with_transaction(TransactionMode::ReadOnly, move |txn| async move {
                tracker.pending_tables(&txn, node)
            })
            .await
    }

    /// Applies acknowledgements from `node`. Returns the rows cleared.
    pub async fn acknowledge(&self, node: NodeId, acks: Vec<AckEntry>) -> CoreResult<usize> {
        self.ensure_open()?;
        if acks.is_empty() {
            return Ok(0);
        }
        let tracker = Arc::clone(&self.tracker);
        self.coordinator
            .with_transaction(TransactionMode::ReadWrite, move |txn| async move {
                tracker.acknowledge(&txn, node, &acks)
            })
            .await
    }

    /// Closes both streams. Every later call fails with `Closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.commit_subscription.lock().take();
        self.outgoing.lock().take();
        self.incoming.lock().take();
        tracing::debug!(node = self.local_node, "node event manager closed");
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
