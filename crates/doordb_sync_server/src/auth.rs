//! Node authentication.
//!
//! Every request carries `(nodeId, authToken)`. The server stores only the
//! SHA-256 digest of a node's token in its `DoorNode` row; verified digests
//! are cached in memory so the common path takes a read lock only.
//!
//! Unknown nodes are registered on first contact when trust-on-first-use is
//! enabled. Cache misses are serialized, so two concurrent first requests
//! from the same node cannot both register it.

use crate::error::{ServerError, ServerResult};
use doordb_core::{DoorDatabase, NodeId};
use doordb_sync_protocol::NodeCredentials;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Hex SHA-256 digest of an auth token.
pub fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Matched a cached digest.
    Cached,
    /// Matched the stored `DoorNode` row.
    Verified,
    /// Unknown node, registered now.
    Registered,
}

/// Credential cache backed by the `DoorNode` table.
pub struct NodeIdAuthCache {
    db: Arc<DoorDatabase>,
    trust_on_first_use: bool,
    verified: RwLock<HashMap<NodeId, String>>,
    miss: tokio::sync::Mutex<()>,
}

impl NodeIdAuthCache {
    /// Creates an empty cache over `db`.
    pub fn new(db: Arc<DoorDatabase>, trust_on_first_use: bool) -> Self {
        Self {
            db,
            trust_on_first_use,
            verified: RwLock::new(HashMap::new()),
            miss: tokio::sync::Mutex::new(()),
        }
    }

    /// Verifies `credentials`.
    ///
    /// # Errors
    ///
    /// `AuthRejected` on a token mismatch, for the server's own node id, or
    /// for an unknown node when trust-on-first-use is off.
    pub async fn verify(&self, credentials: &NodeCredentials) -> ServerResult<AuthOutcome> {
        let node_id = credentials.node_id;
        if node_id == self.db.node_id() {
            tracing::warn!(node_id, "request claims the server's own node id");
            return Err(ServerError::AuthRejected { node_id });
        }
        let digest = token_digest(&credentials.auth_token);

        if let Some(known) = self.verified.read().get(&node_id) {
            return check(node_id, known, &digest).map(|()| AuthOutcome::Cached);
        }

        let _miss = self.miss.lock().await;
        // Another request may have filled the entry while we waited.
        if let Some(known) = self.verified.read().get(&node_id) {
            return check(node_id, known, &digest).map(|()| AuthOutcome::Cached);
        }

        let outcome = match self.db.node(node_id).await? {
            Some(node) => {
                check(node_id, &node.auth, &digest)?;
                AuthOutcome::Verified
            }
            None if self.trust_on_first_use => {
                self.db.register_node(node_id, digest.clone()).await?;
                tracing::info!(node_id, "node registered on first use");
                AuthOutcome::Registered
            }
            None => {
                tracing::warn!(node_id, "unknown node rejected");
                return Err(ServerError::AuthRejected { node_id });
            }
        };
        self.verified.write().insert(node_id, digest);
        Ok(outcome)
    }

    /// Registers `node_id` with `token` ahead of its first request.
    ///
    /// Returns the number of tracker rows seeded for it.
    pub async fn register(&self, node_id: NodeId, token: &str) -> ServerResult<usize> {
        let digest = token_digest(token);
        let _miss = self.miss.lock().await;
        let seeded = self.db.register_node(node_id, digest.clone()).await?;
        self.verified.write().insert(node_id, digest);
        Ok(seeded)
    }

    /// Drops `node_id` from the cache.
    pub fn forget(&self, node_id: NodeId) {
        self.verified.write().remove(&node_id);
    }

    /// Number of cached nodes.
    pub fn len(&self) -> usize {
        self.verified.read().len()
    }

    /// Returns true if no node is cached.
    pub fn is_empty(&self) -> bool {
        self.verified.read().is_empty()
    }
}

fn check(node_id: NodeId, stored: &str, presented: &str) -> ServerResult<()> {
    if stored == presented {
        Ok(())
    } else {
        tracing::warn!(node_id, "auth token mismatch");
        Err(ServerError::AuthRejected { node_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doordb_testkit::open_memory_node;

    #[test]
    fn digest_is_stable_hex() {
        let digest = token_digest("secret");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, token_digest("secret"));
        assert_ne!(digest, token_digest("Secret"));
    }

    #[tokio::test]
    async fn first_use_registers_then_caches() {
        let (source, db) = open_memory_node(1).await;
        let cache = NodeIdAuthCache::new(Arc::clone(&db), true);
        let creds = NodeCredentials::new(10, "t");

        assert_eq!(cache.verify(&creds).await.unwrap(), AuthOutcome::Registered);
        assert_eq!(cache.verify(&creds).await.unwrap(), AuthOutcome::Cached);
        assert_eq!(cache.len(), 1);

        // Only the digest reaches storage.
        let stored = source.rows("DoorNode");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["auth"], serde_json::json!(token_digest("t")));
    }

    #[tokio::test]
    async fn mismatched_token_is_rejected() {
        let (_source, db) = open_memory_node(1).await;
        let cache = NodeIdAuthCache::new(Arc::clone(&db), true);
        cache.verify(&NodeCredentials::new(10, "t")).await.unwrap();

        let err = cache
            .verify(&NodeCredentials::new(10, "other"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::AuthRejected { node_id: 10 }));
    }

    #[tokio::test]
    async fn stored_node_is_verified_after_restart() {
        let (_source, db) = open_memory_node(1).await;
        let first = NodeIdAuthCache::new(Arc::clone(&db), true);
        first.register(10, "t").await.unwrap();

        let fresh = NodeIdAuthCache::new(Arc::clone(&db), false);
        let outcome = fresh.verify(&NodeCredentials::new(10, "t")).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Verified);
    }

    #[tokio::test]
    async fn unknown_node_rejected_without_first_use() {
        let (_source, db) = open_memory_node(1).await;
        let cache = NodeIdAuthCache::new(Arc::clone(&db), false);
        assert!(cache.verify(&NodeCredentials::new(10, "t")).await.is_err());
        assert!(cache
            .verify(&NodeCredentials::new(1, "t"))
            .await
            .is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_requests_register_once() {
        let (_source, db) = open_memory_node(1).await;
        let cache = Arc::new(NodeIdAuthCache::new(Arc::clone(&db), true));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                cache.verify(&NodeCredentials::new(10, "t")).await
            }));
        }
        let mut registered = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() == AuthOutcome::Registered {
                registered += 1;
            }
        }
        assert_eq!(registered, 1);
    }
}
