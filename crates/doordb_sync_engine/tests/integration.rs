//! Integration tests for sync engine and server.

use async_trait::async_trait;
use doordb_core::{DoorDatabase, NodeId};
use doordb_sync_engine::{
    ChunkStream, HttpTransport, LoopbackClient, LoopbackServer, RetryConfig, SyncConfig,
    SyncEngine, SyncError, SyncState,
};
use doordb_sync_protocol::{HttpRequest, HttpResponse};
use doordb_sync_server::{ServerConfig, SseStream, SyncServer};
use doordb_testkit::{
    get_row, init_tracing, open_memory_node, put_course, put_person, COURSE, PERSON,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Routes loopback requests into an in-process server.
struct InProcess(Arc<SyncServer>);

struct SseChunks(SseStream);

#[async_trait]
impl ChunkStream for SseChunks {
    async fn next_chunk(&mut self) -> Option<Result<String, String>> {
        self.0.next_frame().await.map(Ok)
    }
}

#[async_trait]
impl LoopbackServer for InProcess {
    async fn handle(&self, request: HttpRequest) -> HttpResponse {
        self.0.handle_http(request).await
    }

    async fn subscribe(&self, request: HttpRequest) -> Result<Box<dyn ChunkStream>, HttpResponse> {
        match self.0.open_stream(&request).await {
            Ok(stream) => Ok(Box::new(SseChunks(stream))),
            Err(err) => Err(HttpResponse::error(err.status_code(), err.to_string())),
        }
    }
}

type Engine = SyncEngine<HttpTransport<LoopbackClient<InProcess>>>;

async fn server(config: ServerConfig) -> Arc<SyncServer> {
    let (_source, db) = open_memory_node(1).await;
    Arc::new(SyncServer::new(db, config).unwrap())
}

async fn client(server: &Arc<SyncServer>, node_id: NodeId) -> (Arc<DoorDatabase>, Arc<Engine>) {
    let (_source, db) = open_memory_node(node_id).await;
    let config = SyncConfig::new(node_id, format!("token-{node_id}"), "memory://sync").with_retry(
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50)),
    );
    let transport = HttpTransport::new(
        config.server_url.clone(),
        LoopbackClient::new(Arc::new(InProcess(Arc::clone(server)))),
    );
    let engine = SyncEngine::new(config, Arc::clone(&db), transport).unwrap();
    (db, engine)
}

async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

async fn etag_of(db: &DoorDatabase, table: i32, pk: i64) -> Option<i64> {
    get_row(db, table, pk).await.and_then(|row| row["etag"].as_i64())
}

#[tokio::test]
async fn one_shot_sync_round_trip() {
    init_tracing();
    let server = server(ServerConfig::default()).await;
    let (a_db, a) = client(&server, 10).await;
    let (b_db, b) = client(&server, 20).await;

    // B registers first so the server tracks A's rows for it.
    b.sync().await.unwrap();

    put_person(&a_db, 5, 1).await;
    put_course(&a_db, 6, 1).await;
    let pushed = a.sync().await.unwrap();
    assert_eq!(pushed.pushed, 2);
    assert_eq!(etag_of(server.database(), PERSON, 5).await, Some(1));

    let pulled = b.sync().await.unwrap();
    assert_eq!(pulled.pulled, 2);
    assert_eq!(pulled.pushed, 0);
    assert_eq!(etag_of(&b_db, COURSE, 6).await, Some(1));

    // Nothing left anywhere: a second cycle is empty.
    let again = a.sync().await.unwrap();
    assert_eq!((again.pulled, again.pushed), (0, 0));
}

#[tokio::test]
async fn streaming_clients_converge() {
    init_tracing();
    let server = server(ServerConfig::default()).await;
    let (a_db, a) = client(&server, 10).await;
    let (b_db, b) = client(&server, 20).await;
    a.start();
    b.start();
    eventually("both clients streaming", || async {
        a.state() == SyncState::Streaming
            && b.state() == SyncState::Streaming
            && server.subscriber_count() == 2
    })
    .await;

    put_person(&a_db, 5, 1).await;
    eventually("B to receive A's write", || async {
        etag_of(&b_db, PERSON, 5).await == Some(1)
    })
    .await;

    put_person(&b_db, 5, 2).await;
    eventually("A to receive B's update", || async {
        etag_of(&a_db, PERSON, 5).await == Some(2)
    })
    .await;

    // Server-side writes reach both.
    put_course(server.database(), 9, 1).await;
    eventually("course on both clients", || async {
        etag_of(&a_db, COURSE, 9).await == Some(1) && etag_of(&b_db, COURSE, 9).await == Some(1)
    })
    .await;

    a.stop().await;
    b.stop().await;
    assert!(a_db.pending_for_node(1, None, 10).await.unwrap().is_empty());
    assert!(b_db.pending_for_node(1, None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn offline_changes_reconcile_after_reconnect() {
    init_tracing();
    let server = server(ServerConfig::default()).await;
    let (a_db, a) = client(&server, 10).await;
    a.start();
    eventually("client streaming", || async { a.state() == SyncState::Streaming }).await;

    a.transport().client().set_online(false);
    server.disconnect_all();
    eventually("client to notice", || async { a.stats().reconnects >= 1 }).await;

    put_person(&a_db, 7, 1).await;
    put_course(server.database(), 3, 1).await;
    assert_eq!(etag_of(server.database(), PERSON, 7).await, None);

    a.transport().client().set_online(true);
    eventually("both sides to converge", || async {
        etag_of(&a_db, COURSE, 3).await == Some(1)
            && etag_of(server.database(), PERSON, 7).await == Some(1)
    })
    .await;
    assert!(a.stats().cycles_completed >= 2);

    a.stop().await;
    assert_eq!(a.state(), SyncState::Stopped);
}

#[tokio::test]
async fn rejected_credentials_are_terminal() {
    init_tracing();
    let server = server(ServerConfig::default().with_trust_on_first_use(false)).await;
    let (_db, a) = client(&server, 10).await;

    let err = a.sync().await.unwrap_err();
    assert!(matches!(err, SyncError::AuthenticationFailed(_)));

    a.start();
    eventually("engine to give up", || async { a.state() == SyncState::Error }).await;
    assert_eq!(a.stats().reconnects, 0);

    server.register_node(10, "token-10").await.unwrap();
    let result = a.sync().await.unwrap();
    assert_eq!(result.pulled, 0);
    assert_eq!(a.server_node(), Some(1));
}

#[tokio::test]
async fn pushed_rows_are_not_echoed_back() {
    let server = server(ServerConfig::default()).await;
    let (a_db, a) = client(&server, 10).await;
    put_person(&a_db, 1, 1).await;
    a.sync().await.unwrap();

    let stored = get_row(server.database(), PERSON, 1).await.unwrap();
    assert_eq!(stored["name"], json!("person-1"));
    assert!(server
        .database()
        .pending_for_node(10, None, 10)
        .await
        .unwrap()
        .is_empty());
    let again = a.sync().await.unwrap();
    assert_eq!(again.pulled, 0);
}
