//! Request handlers for the replication endpoints.

use crate::auth::NodeIdAuthCache;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::subscribers::{SseStream, SubscriberRegistry};
use doordb_core::DoorDatabase;
use doordb_sync_protocol::{
    AckRequest, AckResponse, DoorMessage, MessageKind, NodeCredentials, PullRequest,
    PullResponse, PushResponse, SseEvent,
};
use std::sync::Arc;

/// Shared state of the request handlers.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// The server's local database.
    pub db: Arc<DoorDatabase>,
    /// Credential cache.
    pub auth: NodeIdAuthCache,
    /// Open subscription streams.
    pub subscribers: Arc<SubscriberRegistry>,
}

impl HandlerContext {
    /// Creates a handler context.
    pub fn new(config: ServerConfig, db: Arc<DoorDatabase>) -> Self {
        let auth = NodeIdAuthCache::new(Arc::clone(&db), config.trust_on_first_use);
        let subscribers = SubscriberRegistry::new(config.sse_channel_capacity);
        Self {
            config,
            db,
            auth,
            subscribers,
        }
    }
}

/// Handler for replication requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Opens a subscription stream.
    ///
    /// The stream starts with `INIT` carrying the server's node id, followed
    /// by one `INVALIDATE` per table that already has pending rows for the
    /// caller.
    pub async fn handle_connect(&self, credentials: &NodeCredentials) -> ServerResult<SseStream> {
        self.context.auth.verify(credentials).await?;
        let node = credentials.node_id;
        let mut stream = self.context.subscribers.open(node, self.context.db.node_id());

        let pending = self.context.db.events().pending_tables(node).await?;
        for table_id in pending {
            if !stream.offer(SseEvent::Invalidate(table_id)) {
                // Buffer full: the client reconciles all tables on connect.
                tracing::debug!(node, "catch-up truncated");
                break;
            }
        }
        stream.seal();
        Ok(stream)
    }

    /// Returns entities pending for the caller in one table.
    ///
    /// Nothing is cleared here; the caller acknowledges what it applied.
    pub async fn handle_pull(
        &self,
        credentials: &NodeCredentials,
        request: PullRequest,
    ) -> ServerResult<PullResponse> {
        self.context.auth.verify(credentials).await?;
        self.context.db.registry().require(request.table_id)?;
        let limit = request.limit.min(self.context.config.max_pull_batch).max(1);
        let batch = self
            .context
            .db
            .events()
            .pending_batch(
                credentials.node_id,
                Some(request.table_id),
                limit,
                MessageKind::Pull,
            )
            .await?;
        tracing::debug!(
            node = credentials.node_id,
            table_id = request.table_id,
            entities = batch.message.replications.len(),
            has_more = batch.has_more,
            "pull served"
        );
        Ok(PullResponse {
            message: batch.message,
            has_more: batch.has_more,
        })
    }

    /// Applies entities pushed by the caller.
    pub async fn handle_push(
        &self,
        credentials: &NodeCredentials,
        message: DoorMessage,
    ) -> ServerResult<PushResponse> {
        self.context.auth.verify(credentials).await?;
        if message.from_node != credentials.node_id {
            return Err(ServerError::InvalidRequest(format!(
                "message from node {} sent with credentials of node {}",
                message.from_node, credentials.node_id
            )));
        }
        if message.replications.len() > self.context.config.max_push_batch {
            return Err(ServerError::InvalidRequest(format!(
                "too many entities: {} > {}",
                message.replications.len(),
                self.context.config.max_push_batch
            )));
        }
        let outcome = self.context.db.apply_incoming(message).await?;
        tracing::debug!(
            node = credentials.node_id,
            applied = outcome.applied,
            skipped = outcome.skipped,
            "push applied"
        );
        Ok(PushResponse {
            applied: outcome.applied,
        })
    }

    /// Clears pending flags for versions the caller applied.
    pub async fn handle_ack(
        &self,
        credentials: &NodeCredentials,
        request: AckRequest,
    ) -> ServerResult<AckResponse> {
        self.context.auth.verify(credentials).await?;
        let cleared = self
            .context
            .db
            .acknowledge(credentials.node_id, request.acks)
            .await?;
        Ok(AckResponse { cleared })
    }
}
