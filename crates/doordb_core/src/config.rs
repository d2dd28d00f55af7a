//! Database configuration.

use crate::types::NodeId;
use std::time::Duration;

/// Backoff for re-establishing the invalidation listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerRetry {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
}

impl Default for ListenerRetry {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ListenerRetry {
    /// Delay before retry number `attempt` (zero-based), doubling up to the maximum.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Configuration for opening a [`DoorDatabase`](crate::DoorDatabase).
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// This node's id. Generated and persisted on first open when `None`.
    pub node_id: Option<NodeId>,

    /// Maximum number of pooled connections.
    pub pool_size: usize,

    /// How long to wait for a free connection.
    pub acquire_timeout: Duration,

    /// Per-transaction time limit for the block (`None` = unlimited).
    pub transaction_timeout: Option<Duration>,

    /// Notification channel used by multi-writer change tracking.
    pub invalidation_channel: String,

    /// Retry policy for the multi-writer invalidation listener.
    pub listener_retry: ListenerRetry,

    /// Number of low bits of a primary key used for the per-node counter.
    pub key_counter_bits: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            pool_size: 4,
            acquire_timeout: Duration::from_secs(30),
            transaction_timeout: Some(Duration::from_secs(60)),
            invalidation_channel: "doorinvalidations".into(),
            listener_retry: ListenerRetry::default(),
            key_counter_bits: 32,
        }
    }
}

impl DatabaseConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets this node's id.
    #[must_use]
    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Sets the pool size.
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    /// Sets the connection acquire timeout.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the per-transaction timeout.
    #[must_use]
    pub fn with_transaction_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Sets the invalidation channel name.
    #[must_use]
    pub fn with_invalidation_channel(mut self, channel: impl Into<String>) -> Self {
        self.invalidation_channel = channel.into();
        self
    }

    /// Sets the listener retry policy.
    #[must_use]
    pub fn with_listener_retry(mut self, retry: ListenerRetry) -> Self {
        self.listener_retry = retry;
        self
    }

    /// Sets the number of counter bits in generated primary keys.
    #[must_use]
    pub fn with_key_counter_bits(mut self, bits: u32) -> Self {
        self.key_counter_bits = bits;
        self
    }
}
