//! Subscription streams and the registry that feeds them.

use doordb_core::{NodeId, TableId};
use doordb_sync_protocol::{NodeEvent, SseEvent};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<SseEvent>,
}

/// Open subscription streams, by node.
pub struct SubscriberRegistry {
    capacity: usize,
    next_id: AtomicU64,
    nodes: Mutex<HashMap<NodeId, Vec<Subscriber>>>,
}

impl SubscriberRegistry {
    /// Creates a registry whose streams buffer `capacity` events.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(2),
            next_id: AtomicU64::new(1),
            nodes: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a stream for `node` that starts with `Init(server_node)`.
    ///
    /// The stream is registered before returning, so it sees every event
    /// emitted from now on.
    pub fn open(self: &Arc<Self>, node: NodeId, server_node: NodeId) -> SseStream {
        let (sender, receiver) = mpsc::channel(self.capacity);
        // Fresh channel with capacity >= 2: cannot fail.
        let _ = sender.try_send(SseEvent::Init(server_node));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.nodes.lock().entry(node).or_default().push(Subscriber {
            id,
            sender: sender.clone(),
        });
        tracing::info!(node, subscriber = id, "subscriber connected");
        SseStream {
            node,
            id,
            receiver,
            sender: Some(sender),
            registry: Arc::downgrade(self),
        }
    }

    /// Delivers one commit's events.
    ///
    /// Events for the same (node, table) collapse into one `INVALIDATE`.
    /// A subscriber whose buffer is full is dropped: it reconnects and
    /// reconciles every table, which covers whatever it missed.
    pub fn notify(&self, events: &[NodeEvent]) {
        let targets: BTreeSet<(NodeId, TableId)> =
            events.iter().map(|e| (e.to_node, e.table_id)).collect();
        let mut nodes = self.nodes.lock();
        for (node, table_id) in targets {
            let Some(subscribers) = nodes.get_mut(&node) else {
                continue;
            };
            subscribers.retain(|sub| match sub.sender.try_send(SseEvent::Invalidate(table_id)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(node, subscriber = sub.id, "subscriber lagging, disconnecting");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
            if subscribers.is_empty() {
                nodes.remove(&node);
            }
        }
    }

    /// Disconnects every subscriber.
    pub fn disconnect_all(&self) {
        let dropped: usize = self.nodes.lock().drain().map(|(_, subs)| subs.len()).sum();
        if dropped > 0 {
            tracing::info!(dropped, "all subscribers disconnected");
        }
    }

    /// Number of open streams.
    pub fn len(&self) -> usize {
        self.nodes.lock().values().map(Vec::len).sum()
    }

    /// Returns true if no stream is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, node: NodeId, id: u64) {
        let mut nodes = self.nodes.lock();
        if let Some(subscribers) = nodes.get_mut(&node) {
            subscribers.retain(|sub| sub.id != id);
            if subscribers.is_empty() {
                nodes.remove(&node);
            }
        }
    }
}

/// One subscriber's event stream.
///
/// Dropping the stream unregisters it.
pub struct SseStream {
    node: NodeId,
    id: u64,
    receiver: mpsc::Receiver<SseEvent>,
    sender: Option<mpsc::Sender<SseEvent>>,
    registry: std::sync::Weak<SubscriberRegistry>,
}

impl std::fmt::Debug for SseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseStream")
            .field("node", &self.node)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl SseStream {
    /// Node this stream belongs to.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Queues an event without waiting. Returns false if the buffer is full
    /// or the stream was disconnected.
    pub(crate) fn offer(&self, event: SseEvent) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|sender| sender.try_send(event).is_ok())
    }

    /// Stops accepting locally queued events; the stream ends once the
    /// registry drops it too.
    pub(crate) fn seal(&mut self) {
        self.sender = None;
    }

    /// Next event, or `None` once the server disconnected the stream.
    pub async fn next_event(&mut self) -> Option<SseEvent> {
        self.receiver.recv().await
    }

    /// Next event as an SSE frame.
    pub async fn next_frame(&mut self) -> Option<String> {
        self.next_event().await.map(|event| event.encode())
    }

    /// Next event if one is already buffered.
    pub fn try_next_event(&mut self) -> Option<SseEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for SseStream {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.node, self.id);
            tracing::debug!(node = self.node, subscriber = self.id, "subscriber closed");
        }
    }
}
