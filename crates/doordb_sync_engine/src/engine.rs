//! Client replication engine.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{EventStream, ReplicationTransport};
use doordb_core::{DoorDatabase, NodeId, TableId};
use doordb_sync_protocol::{AckRequest, MessageKind, NodeEvent, PullRequest, SseEvent};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Opening the subscription stream.
    Connecting,
    /// Pulling and pushing every table after a (re)connect.
    Reconciling,
    /// Connected and following invalidations.
    Streaming,
    /// Waiting before reconnecting.
    RetryWait,
    /// Stopped after a terminal error.
    Error,
    /// Stopped on request.
    Stopped,
}

impl SyncState {
    /// Returns true if the engine is in an active sync state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Connecting | SyncState::Reconciling | SyncState::Streaming
        )
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Completed full reconciliations.
    pub cycles_completed: u64,
    /// Entities received through pulls.
    pub entities_pulled: u64,
    /// Entities sent through pushes.
    pub entities_pushed: u64,
    /// Reconnect attempts after a failure.
    pub reconnects: u64,
    /// Last completed reconciliation.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCycleResult {
    /// Entities pulled.
    pub pulled: u64,
    /// Entities pushed.
    pub pushed: u64,
    /// Duration of the cycle.
    pub duration: Duration,
}

/// Replicates a local [`DoorDatabase`] with one server.
///
/// [`start`](Self::start) runs the subscription loop in the background:
/// connect, learn the server's node id from `INIT`, reconcile every table,
/// then pull each table the server invalidates and push local changes as
/// they commit. Any failure drops the stream; the loop reconnects with
/// backoff and reconciles again. [`sync`](Self::sync) runs a single
/// reconciliation in the foreground.
pub struct SyncEngine<T: ReplicationTransport> {
    config: SyncConfig,
    db: Arc<DoorDatabase>,
    transport: Arc<T>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    server_node: RwLock<Option<NodeId>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: ReplicationTransport + 'static> SyncEngine<T> {
    /// Creates an engine for `db`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the configured node id is not the database's.
    pub fn new(config: SyncConfig, db: Arc<DoorDatabase>, transport: T) -> SyncResult<Arc<Self>> {
        if config.node_id() != db.node_id() {
            return Err(SyncError::InvalidConfig(format!(
                "credentials are for node {} but the database is node {}",
                config.node_id(),
                db.node_id()
            )));
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            db,
            transport: Arc::new(transport),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            server_node: RwLock::new(None),
            shutdown,
            task: Mutex::new(None),
        }))
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// The server's node id, once a stream has been opened.
    pub fn server_node(&self) -> Option<NodeId> {
        *self.server_node.read()
    }

    /// The transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Starts the background subscription loop. Does nothing if it is
    /// already running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.shutdown.send_replace(false);
        let engine = Arc::clone(self);
        *task = Some(tokio::spawn(async move { engine.run().await }));
    }

    /// Stops the background loop and waits for it to finish.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "sync task failed");
            }
        }
        self.set_state(SyncState::Stopped);
    }

    /// Runs one reconciliation: connects to learn the server, pulls every
    /// table and pushes every pending row.
    pub async fn sync(&self) -> SyncResult<SyncCycleResult> {
        let start = Instant::now();
        let result = async {
            let (_stream, server_node) = self.open_stream().await?;
            self.reconcile(server_node).await
        }
        .await;
        match result {
            Ok((pulled, pushed)) => {
                self.set_state(SyncState::Idle);
                Ok(SyncCycleResult {
                    pulled,
                    pushed,
                    duration: start.elapsed(),
                })
            }
            Err(err) => {
                self.record_error(&err);
                self.set_state(SyncState::Error);
                Err(err)
            }
        }
    }

    /// Performs [`sync`](Self::sync) with retry on transient errors.
    pub async fn sync_with_retry(&self) -> SyncResult<SyncCycleResult> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            match self.sync().await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    self.set_state(SyncState::RetryWait);
                    tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let err = match self.session(&mut shutdown, &mut attempt).await {
                Ok(()) => break,
                Err(err) => err,
            };
            self.record_error(&err);
            if !err.is_retryable() {
                tracing::error!(error = %err, "replication stopped");
                self.set_state(SyncState::Error);
                return;
            }

            attempt = attempt.saturating_add(1);
            self.stats.write().reconnects += 1;
            let delay = self.config.retry.delay_for_attempt(attempt);
            tracing::warn!(error = %err, attempt, ?delay, "replication interrupted, reconnecting");
            self.set_state(SyncState::RetryWait);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        self.set_state(SyncState::Stopped);
    }

    /// One connection: reconcile, then follow the stream until it fails or
    /// shutdown is requested.
    async fn session(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        attempt: &mut u32,
    ) -> SyncResult<()> {
        // Subscribe before reconciling so no commit falls in between.
        let mut outgoing = self.db.events().subscribe_outgoing()?;
        let (mut stream, server_node) = self.open_stream().await?;
        self.reconcile(server_node).await?;
        *attempt = 0;
        self.set_state(SyncState::Streaming);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                event = stream.next_event() => match event? {
                    Some(SseEvent::Invalidate(table_id)) => {
                        let pulled = self.pull_table(table_id).await?;
                        tracing::debug!(table_id, pulled, "invalidation handled");
                    }
                    Some(SseEvent::Init(node)) if node == server_node => {}
                    Some(SseEvent::Init(node)) => {
                        return Err(SyncError::Protocol(format!(
                            "server changed node id from {server_node} to {node}"
                        )));
                    }
                    None => return Err(SyncError::transport_retryable("subscription closed")),
                },
                batch = outgoing.recv(), if self.config.auto_push => {
                    if wants_push(batch, server_node)? {
                        self.push_pending(server_node).await?;
                    }
                }
            }
        }
    }

    async fn open_stream(&self) -> SyncResult<(EventStream, NodeId)> {
        self.set_state(SyncState::Connecting);
        let mut stream = self.transport.connect(&self.config.credentials).await?;
        let server_node = match stream.next_event().await? {
            Some(SseEvent::Init(node)) => node,
            Some(other) => {
                return Err(SyncError::Protocol(format!(
                    "expected INIT, got {}",
                    other.name()
                )))
            }
            None => return Err(SyncError::transport_retryable("stream closed before INIT")),
        };
        self.adopt_server(server_node).await?;
        tracing::info!(server_node, "connected");
        Ok((stream, server_node))
    }

    async fn adopt_server(&self, server_node: NodeId) -> SyncResult<()> {
        if self.server_node() == Some(server_node) {
            return Ok(());
        }
        if self.db.node(server_node).await?.is_none() {
            let seeded = self.db.register_node(server_node, String::new()).await?;
            tracing::info!(server_node, seeded, "server node registered");
        }
        *self.server_node.write() = Some(server_node);
        Ok(())
    }

    async fn reconcile(&self, server_node: NodeId) -> SyncResult<(u64, u64)> {
        self.set_state(SyncState::Reconciling);
        let tables: Vec<TableId> = self
            .db
            .registry()
            .in_send_order()
            .iter()
            .map(|entity| entity.table_id)
            .collect();
        let mut pulled = 0;
        for table_id in tables {
            pulled += self.pull_table(table_id).await?;
        }
        let pushed = self.push_pending(server_node).await?;

        let mut stats = self.stats.write();
        stats.cycles_completed += 1;
        stats.last_sync_time = Some(Instant::now());
        stats.last_error = None;
        drop(stats);
        tracing::debug!(pulled, pushed, "reconciled");
        Ok((pulled, pushed))
    }

    /// Pulls one table until the server has nothing more pending for us.
    ///
    /// Each page is applied in one local transaction and acknowledged only
    /// after that transaction committed.
    async fn pull_table(&self, table_id: TableId) -> SyncResult<u64> {
        let credentials = &self.config.credentials;
        let mut pulled = 0u64;
        loop {
            let request = PullRequest {
                table_id,
                limit: self.config.pull_batch_size,
            };
            let response = self.transport.pull(credentials, request).await?;
            if response.message.is_empty() {
                break;
            }
            let received = response.message.replications.len() as u64;
            let outcome = self.db.apply_incoming(response.message).await?;
            let ack = self
                .transport
                .ack(credentials, AckRequest { acks: outcome.acks })
                .await?;
            pulled += received;
            self.stats.write().entities_pulled += received;
            if !response.has_more {
                break;
            }
            // The next page would repeat this one.
            if ack.cleared == 0 {
                tracing::warn!(table_id, received, "pull made no progress, stopping");
                break;
            }
        }
        Ok(pulled)
    }

    /// Pushes rows pending for the server, acknowledging each batch locally
    /// once the server accepted it.
    async fn push_pending(&self, server_node: NodeId) -> SyncResult<u64> {
        let mut pushed = 0u64;
        loop {
            let batch = self
                .db
                .events()
                .pending_batch(
                    server_node,
                    None,
                    self.config.push_batch_size,
                    MessageKind::Push,
                )
                .await?;
            if batch.message.is_empty() {
                break;
            }
            let sent = batch.message.replications.len() as u64;
            self.transport
                .push(&self.config.credentials, batch.message)
                .await?;
            self.db.acknowledge(server_node, batch.acks).await?;
            pushed += sent;
            self.stats.write().entities_pushed += sent;
            if !batch.has_more {
                break;
            }
        }
        Ok(pushed)
    }

    fn record_error(&self, err: &SyncError) {
        self.stats.write().last_error = Some(err.to_string());
    }
}

fn wants_push(
    batch: Result<Arc<Vec<NodeEvent>>, RecvError>,
    server_node: NodeId,
) -> SyncResult<bool> {
    match batch {
        Ok(events) => Ok(events.iter().any(|e| e.to_node == server_node)),
        // Missed batches may have been for the server.
        Err(RecvError::Lagged(_)) => Ok(true),
        Err(RecvError::Closed) => Err(SyncError::Cancelled),
    }
}
