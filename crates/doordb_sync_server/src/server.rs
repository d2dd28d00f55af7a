//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::subscribers::{SseStream, SubscriberRegistry};
use doordb_core::{DoorDatabase, NodeId};
use doordb_sync_protocol::{
    endpoints, AckRequest, DoorMessage, HttpMethod, HttpRequest, HttpResponse, NodeCredentials,
    NodeEvent, PullRequest,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// The replication server.
///
/// Serves the four replication endpoints on top of a [`DoorDatabase`] and
/// forwards the database's outgoing events to subscribed nodes. Binding
/// to a concrete HTTP stack is up to the embedder: route plain requests to
/// [`handle_http`](Self::handle_http) and the connect endpoint to
/// [`open_stream`](Self::open_stream).
///
/// # Example
///
/// ```rust,ignore
/// let server = SyncServer::new(db, ServerConfig::default())?;
/// let response = server.handle_http(request).await;
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SyncServer {
    /// Creates a server and starts forwarding events to subscribers.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `Closed` if the database has already been closed.
    pub fn new(db: Arc<DoorDatabase>, config: ServerConfig) -> ServerResult<Self> {
        let events = db.events().subscribe_outgoing()?;
        let context = Arc::new(HandlerContext::new(config, db));
        let handler = RequestHandler::new(Arc::clone(&context));
        let pump = tokio::spawn(forward_events(events, Arc::clone(&context.subscribers)));
        tracing::info!(node_id = context.db.node_id(), "sync server started");
        Ok(Self {
            handler,
            context,
            pump: Mutex::new(Some(pump)),
        })
    }

    /// The server's node id.
    pub fn node_id(&self) -> NodeId {
        self.context.db.node_id()
    }

    /// The server's database.
    pub fn database(&self) -> &Arc<DoorDatabase> {
        &self.context.db
    }

    /// Number of open subscription streams.
    pub fn subscriber_count(&self) -> usize {
        self.context.subscribers.len()
    }

    /// Registers a node ahead of its first request.
    pub async fn register_node(&self, node_id: NodeId, token: &str) -> ServerResult<usize> {
        self.context.auth.register(node_id, token).await
    }

    /// Deregisters a node, dropping its tracker rows and cached credentials.
    pub async fn deregister_node(&self, node_id: NodeId) -> ServerResult<usize> {
        self.context.auth.forget(node_id);
        Ok(self.context.db.deregister_node(node_id).await?)
    }

    /// Opens the subscription stream for a connect request.
    pub async fn open_stream(&self, request: &HttpRequest) -> ServerResult<SseStream> {
        if request.path != endpoints::CONNECT {
            return Err(ServerError::NotFound(request.path.clone()));
        }
        let credentials = NodeCredentials::from_request(request)?;
        self.handler.handle_connect(&credentials).await
    }

    /// Routes a pull, push or acknowledge request.
    ///
    /// Errors are returned as responses with the matching status code.
    pub async fn handle_http(&self, request: HttpRequest) -> HttpResponse {
        let path = request.path.clone();
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(err) => {
                let status = err.status_code();
                if err.is_server_error() {
                    tracing::error!(path = %path, status, error = %err, "request failed");
                } else {
                    tracing::debug!(path = %path, status, error = %err, "request rejected");
                }
                HttpResponse::error(status, err.to_string())
            }
        }
    }

    async fn dispatch(&self, request: HttpRequest) -> ServerResult<HttpResponse> {
        if request.method != HttpMethod::Post {
            return Err(ServerError::NotFound(format!(
                "{:?} {}",
                request.method, request.path
            )));
        }
        let credentials = NodeCredentials::from_request(&request)?;
        let response = match request.path.as_str() {
            endpoints::PULL => {
                let body: PullRequest = request.json()?;
                HttpResponse::ok_json(&self.handler.handle_pull(&credentials, body).await?)?
            }
            endpoints::PUSH => {
                let body: DoorMessage = request.json()?;
                HttpResponse::ok_json(&self.handler.handle_push(&credentials, body).await?)?
            }
            endpoints::ACK => {
                let body: AckRequest = request.json()?;
                HttpResponse::ok_json(&self.handler.handle_ack(&credentials, body).await?)?
            }
            other => return Err(ServerError::NotFound(other.to_string())),
        };
        Ok(response)
    }

    /// Disconnects every subscriber. Clients reconnect and reconcile.
    pub fn disconnect_all(&self) {
        self.context.subscribers.disconnect_all();
    }

    /// Stops forwarding events and disconnects every subscriber.
    ///
    /// The database stays open; closing it is the owner's call.
    pub fn close(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.context.subscribers.disconnect_all();
        tracing::info!(node_id = self.node_id(), "sync server stopped");
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

async fn forward_events(
    mut events: broadcast::Receiver<Arc<Vec<NodeEvent>>>,
    subscribers: Arc<SubscriberRegistry>,
) {
    loop {
        match events.recv().await {
            Ok(batch) => subscribers.notify(&batch),
            Err(RecvError::Lagged(missed)) => {
                // Missed events cannot be replayed; reconnecting makes every
                // subscriber reconcile from its trackers.
                tracing::warn!(missed, "event forwarder lagged, disconnecting subscribers");
                subscribers.disconnect_all();
            }
            Err(RecvError::Closed) => {
                subscribers.disconnect_all();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doordb_sync_protocol::{PullResponse, PushResponse, SseEvent};
    use doordb_testkit::{open_memory_node, person_row, put_person, PERSON};
    use doordb_sync_protocol::MessageKind;
    use std::time::Duration;

    fn creds() -> NodeCredentials {
        NodeCredentials::new(10, "token")
    }

    async fn server() -> SyncServer {
        let (_source, db) = open_memory_node(1).await;
        SyncServer::new(db, ServerConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn routes_pull_and_push() {
        let server = server().await;
        let push = DoorMessage::new(MessageKind::Push, 10, 1).with_entity(PERSON, person_row(4, 1));
        let request = HttpRequest::post(endpoints::PUSH)
            .with_credentials(&creds())
            .with_json(&push)
            .unwrap();
        let response = server.handle_http(request).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.json::<PushResponse>().unwrap().applied, 1);

        let request = HttpRequest::post(endpoints::PULL)
            .with_credentials(&creds())
            .with_json(&PullRequest {
                table_id: PERSON,
                limit: 10,
            })
            .unwrap();
        let pulled: PullResponse = server.handle_http(request).await.json().unwrap();
        assert!(pulled.message.is_empty());
    }

    #[tokio::test]
    async fn bad_requests_map_to_statuses() {
        let server = server().await;

        let missing_auth = HttpRequest::post(endpoints::PULL);
        assert_eq!(server.handle_http(missing_auth).await.status, 400);

        let unknown = HttpRequest::post("/replication/nope").with_credentials(&creds());
        assert_eq!(server.handle_http(unknown).await.status, 404);

        let get = HttpRequest::get(endpoints::PULL).with_credentials(&creds());
        assert_eq!(server.handle_http(get).await.status, 404);

        server.register_node(10, "token").await.unwrap();
        let bad_token = HttpRequest::post(endpoints::ACK)
            .with_credentials(&NodeCredentials::new(10, "wrong"))
            .with_json(&AckRequest::default())
            .unwrap();
        assert_eq!(server.handle_http(bad_token).await.status, 401);
    }

    #[tokio::test]
    async fn commits_reach_subscribers() {
        let server = server().await;
        let request = HttpRequest::get(endpoints::CONNECT).with_credentials(&creds());
        let mut stream = server.open_stream(&request).await.unwrap();
        assert_eq!(stream.next_event().await, Some(SseEvent::Init(1)));
        assert_eq!(server.subscriber_count(), 1);

        put_person(server.database(), 8, 1).await;
        let event = tokio::time::timeout(Duration::from_secs(1), stream.next_event())
            .await
            .unwrap();
        assert_eq!(event, Some(SseEvent::Invalidate(PERSON)));

        server.close();
        assert_eq!(stream.next_event().await, None);
    }

    #[tokio::test]
    async fn deregistered_node_must_authenticate_again() {
        let (_source, db) = open_memory_node(1).await;
        let server = SyncServer::new(
            db,
            ServerConfig::default().with_trust_on_first_use(false),
        )
        .unwrap();
        server.register_node(10, "token").await.unwrap();
        let request = HttpRequest::get(endpoints::CONNECT).with_credentials(&creds());
        assert!(server.open_stream(&request).await.is_ok());

        server.deregister_node(10).await.unwrap();
        let err = server.open_stream(&request).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
    }
}
