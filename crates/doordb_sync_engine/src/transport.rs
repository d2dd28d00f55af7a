//! Transport layer abstraction for replication.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use doordb_sync_protocol::{
    AckRequest, AckResponse, DoorMessage, NodeCredentials, ProtocolError, PullRequest,
    PullResponse, PushResponse, SseDecoder, SseEvent,
};
use std::collections::VecDeque;

/// A stream of text chunks, as received on an open SSE response.
#[async_trait]
pub trait ChunkStream: Send {
    /// Next chunk. `None` once the peer closed the stream.
    ///
    /// Must be cancel safe: dropping the future before it completes may
    /// not lose data.
    async fn next_chunk(&mut self) -> Option<Result<String, String>>;
}

/// Decoded subscription stream.
pub struct EventStream {
    chunks: Box<dyn ChunkStream>,
    decoder: SseDecoder,
    ready: VecDeque<SseEvent>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("ready", &self.ready)
            .finish_non_exhaustive()
    }
}

impl EventStream {
    /// Wraps a chunk stream.
    pub fn new(chunks: Box<dyn ChunkStream>) -> Self {
        Self {
            chunks,
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
        }
    }

    /// Next event, or `None` once the stream ended.
    ///
    /// Event types this client does not know are skipped. Cancel safe.
    pub async fn next_event(&mut self) -> SyncResult<Option<SseEvent>> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Ok(Some(event));
            }
            let chunk = match self.chunks.next_chunk().await {
                None => return Ok(None),
                Some(Err(message)) => return Err(SyncError::transport_retryable(message)),
                Some(Ok(chunk)) => chunk,
            };
            for decoded in self.decoder.push(&chunk) {
                match decoded {
                    Ok(event) => self.ready.push_back(event),
                    Err(ProtocolError::UnknownEvent(name)) => {
                        tracing::debug!(event = %name, "skipping unknown event");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }
}

/// Client side of the four replication endpoints.
///
/// Abstracts the network layer so the engine can run over HTTP or
/// in-process against a server.
#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    /// Opens the subscription stream.
    async fn connect(&self, credentials: &NodeCredentials) -> SyncResult<EventStream>;

    /// Pulls pending entities of one table.
    async fn pull(
        &self,
        credentials: &NodeCredentials,
        request: PullRequest,
    ) -> SyncResult<PullResponse>;

    /// Pushes a batch of entities.
    async fn push(
        &self,
        credentials: &NodeCredentials,
        message: DoorMessage,
    ) -> SyncResult<PushResponse>;

    /// Acknowledges applied versions.
    async fn ack(
        &self,
        credentials: &NodeCredentials,
        request: AckRequest,
    ) -> SyncResult<AckResponse>;
}
