//! HTTP transport implementation.
//!
//! The actual HTTP client is abstracted via a trait so any stack (reqwest,
//! hyper, a platform client) can carry the requests.

use crate::error::{SyncError, SyncResult};
use crate::transport::{ChunkStream, EventStream, ReplicationTransport};
use async_trait::async_trait;
use doordb_sync_protocol::{
    endpoints, AckRequest, AckResponse, DoorMessage, HttpRequest, HttpResponse, NodeCredentials,
    PullRequest, PullResponse, PushResponse,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result of opening a streaming request.
pub enum StreamOpen {
    /// The server accepted the request and is streaming the body.
    Open(Box<dyn ChunkStream>),
    /// The server answered with an error response.
    Rejected(HttpResponse),
}

impl std::fmt::Debug for StreamOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamOpen::Open(_) => f.write_str("StreamOpen::Open"),
            StreamOpen::Rejected(response) => {
                f.debug_tuple("StreamOpen::Rejected").field(response).finish()
            }
        }
    }
}

/// HTTP client abstraction.
///
/// `Err` means the request never got a response (connection refused,
/// reset, DNS failure); error statuses come back as responses.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the full response.
    async fn send(&self, url: &str, request: HttpRequest) -> Result<HttpResponse, String>;

    /// Sends a request whose response body is streamed.
    async fn open_stream(&self, url: &str, request: HttpRequest) -> Result<StreamOpen, String>;
}

/// HTTP-based replication transport.
///
/// Bodies are JSON; the subscription stream is decoded as SSE.
pub struct HttpTransport<C: HttpClient> {
    base_url: String,
    client: C,
    timeout: Duration,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the per-request timeout. The subscription stream itself is not
    /// subject to it once open.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn timed<T>(&self, fut: impl Future<Output = Result<T, String>>) -> SyncResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(SyncError::transport_retryable(message)),
            Err(_) => Err(SyncError::Timeout),
        }
    }

    async fn post_json<Req, Res>(
        &self,
        path: &str,
        credentials: &NodeCredentials,
        body: &Req,
    ) -> SyncResult<Res>
    where
        Req: serde::Serialize + Sync,
        Res: serde::de::DeserializeOwned,
    {
        let request = HttpRequest::post(path)
            .with_credentials(credentials)
            .with_json(body)?;
        let url = self.url(path);
        let response = self.timed(self.client.send(&url, request)).await?;
        if !response.is_success() {
            return Err(SyncError::from_status(response.status, response.text()));
        }
        Ok(response.json()?)
    }
}

#[async_trait]
impl<C: HttpClient> ReplicationTransport for HttpTransport<C> {
    async fn connect(&self, credentials: &NodeCredentials) -> SyncResult<EventStream> {
        let request = HttpRequest::get(endpoints::CONNECT)
            .with_credentials(credentials)
            .with_header("accept", "text/event-stream");
        let url = self.url(endpoints::CONNECT);
        match self.timed(self.client.open_stream(&url, request)).await? {
            StreamOpen::Open(chunks) => Ok(EventStream::new(chunks)),
            StreamOpen::Rejected(response) => {
                Err(SyncError::from_status(response.status, response.text()))
            }
        }
    }

    async fn pull(
        &self,
        credentials: &NodeCredentials,
        request: PullRequest,
    ) -> SyncResult<PullResponse> {
        self.post_json(endpoints::PULL, credentials, &request).await
    }

    async fn push(
        &self,
        credentials: &NodeCredentials,
        message: DoorMessage,
    ) -> SyncResult<PushResponse> {
        self.post_json(endpoints::PUSH, credentials, &message).await
    }

    async fn ack(
        &self,
        credentials: &NodeCredentials,
        request: AckRequest,
    ) -> SyncResult<AckResponse> {
        self.post_json(endpoints::ACK, credentials, &request).await
    }
}

/// Trait for servers that can handle loopback requests.
#[async_trait]
pub trait LoopbackServer: Send + Sync {
    /// Handles a plain request.
    async fn handle(&self, request: HttpRequest) -> HttpResponse;

    /// Opens a subscription stream, or returns the error response.
    async fn subscribe(&self, request: HttpRequest) -> Result<Box<dyn ChunkStream>, HttpResponse>;
}

/// A loopback HTTP client that routes requests directly to a server in
/// the same process.
///
/// It can be switched offline to simulate network loss: requests then fail
/// as if the connection was refused.
pub struct LoopbackClient<S: LoopbackServer> {
    server: Arc<S>,
    online: AtomicBool,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: Arc<S>) -> Self {
        Self {
            server,
            online: AtomicBool::new(true),
        }
    }

    /// Simulates losing or regaining the network.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Returns true unless switched offline.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn route(&self, url: &str, mut request: HttpRequest) -> Result<HttpRequest, String> {
        if !self.is_online() {
            return Err(format!("connection refused: {url}"));
        }
        // The server only sees the path.
        if let Some(i) = url.find("/replication/") {
            request.path = url[i..].to_string();
        }
        Ok(request)
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn send(&self, url: &str, request: HttpRequest) -> Result<HttpResponse, String> {
        let request = self.route(url, request)?;
        Ok(self.server.handle(request).await)
    }

    async fn open_stream(&self, url: &str, request: HttpRequest) -> Result<StreamOpen, String> {
        let request = self.route(url, request)?;
        Ok(match self.server.subscribe(request).await {
            Ok(chunks) => StreamOpen::Open(chunks),
            Err(response) => StreamOpen::Rejected(response),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ChannelChunks;
    use doordb_sync_protocol::{MessageKind, SseEvent};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<HttpRequest>>,
        response: Mutex<Option<HttpResponse>>,
    }

    #[async_trait]
    impl LoopbackServer for Recorder {
        async fn handle(&self, request: HttpRequest) -> HttpResponse {
            self.requests.lock().push(request);
            self.response
                .lock()
                .clone()
                .unwrap_or_else(|| HttpResponse::error(500, "no response set"))
        }

        async fn subscribe(
            &self,
            request: HttpRequest,
        ) -> Result<Box<dyn ChunkStream>, HttpResponse> {
            self.requests.lock().push(request);
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(Ok(SseEvent::Init(1).encode()));
            Ok(Box::new(ChannelChunks(rx)))
        }
    }

    fn transport(server: Arc<Recorder>) -> HttpTransport<LoopbackClient<Recorder>> {
        HttpTransport::new("https://sync.example.com/", LoopbackClient::new(server))
    }

    fn creds() -> NodeCredentials {
        NodeCredentials::new(5, "secret")
    }

    #[test]
    fn base_url_is_normalized() {
        let transport = transport(Arc::new(Recorder::default()));
        assert_eq!(transport.base_url(), "https://sync.example.com");
    }

    #[tokio::test]
    async fn push_sends_credentials_and_json() {
        let server = Arc::new(Recorder::default());
        *server.response.lock() =
            Some(HttpResponse::ok_json(&PushResponse { applied: 1 }).unwrap());
        let transport = transport(Arc::clone(&server));

        let response = transport
            .push(&creds(), DoorMessage::new(MessageKind::Push, 5, 1))
            .await
            .unwrap();
        assert_eq!(response.applied, 1);

        let requests = server.requests.lock();
        assert_eq!(requests[0].path, endpoints::PUSH);
        assert_eq!(NodeCredentials::from_request(&requests[0]).unwrap(), creds());
        let sent: DoorMessage = requests[0].json().unwrap();
        assert_eq!(sent.from_node, 5);
    }

    #[tokio::test]
    async fn error_statuses_map_to_errors() {
        let server = Arc::new(Recorder::default());
        *server.response.lock() = Some(HttpResponse::error(401, "rejected"));
        let transport = transport(Arc::clone(&server));
        let err = transport
            .ack(&creds(), AckRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn offline_client_fails_retryably() {
        let server = Arc::new(Recorder::default());
        let transport = transport(Arc::clone(&server));
        transport.client().set_online(false);
        let err = transport.connect(&creds()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(server.requests.lock().is_empty());

        transport.client().set_online(true);
        let mut stream = transport.connect(&creds()).await.unwrap();
        assert_eq!(stream.next_event().await.unwrap(), Some(SseEvent::Init(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_requests_time_out() {
        struct Stalled;

        #[async_trait]
        impl HttpClient for Stalled {
            async fn send(&self, _url: &str, _request: HttpRequest) -> Result<HttpResponse, String> {
                std::future::pending().await
            }

            async fn open_stream(
                &self,
                _url: &str,
                _request: HttpRequest,
            ) -> Result<StreamOpen, String> {
                std::future::pending().await
            }
        }

        let transport =
            HttpTransport::new("http://localhost", Stalled).with_timeout(Duration::from_secs(1));
        let err = transport
            .pull(&creds(), PullRequest { table_id: 1, limit: 10 })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
    }
}
