//! Configuration for the sync engine.

use doordb_core::NodeId;
use doordb_sync_protocol::NodeCredentials;
use rand::Rng;
use std::time::Duration;

/// Configuration for a client node.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// This node's id and auth token, sent with every request.
    pub credentials: NodeCredentials,
    /// Server URL, e.g. `https://sync.example.com`.
    pub server_url: String,
    /// Maximum entities requested per pull.
    pub pull_batch_size: usize,
    /// Maximum entities sent per push.
    pub push_batch_size: usize,
    /// Retry and reconnect backoff.
    pub retry: RetryConfig,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Push as soon as a local commit produces rows for the server.
    pub auto_push: bool,
}

impl SyncConfig {
    /// Creates a configuration for `node_id`.
    pub fn new(node_id: NodeId, auth_token: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            credentials: NodeCredentials::new(node_id, auth_token),
            server_url: server_url.into(),
            pull_batch_size: 100,
            push_batch_size: 100,
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(30),
            auto_push: true,
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.credentials.node_id
    }

    /// Sets the pull batch size.
    #[must_use]
    pub fn with_pull_batch_size(mut self, size: usize) -> Self {
        self.pull_batch_size = size.max(1);
        self
    }

    /// Sets the push batch size.
    #[must_use]
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables or disables pushing on local commits.
    #[must_use]
    pub fn with_auto_push(mut self, enabled: bool) -> Self {
        self.auto_push = enabled;
        self
    }
}

/// Backoff between reconnects and between attempts of a one-shot sync.
///
/// The delay after the `n`th failure is `base_delay * factor^(n-1)`, capped
/// at `max_delay`, plus a random share of up to `jitter` of that value so
/// that clients cut off together do not reconnect together.
/// `max_attempts` bounds [`SyncEngine::sync_with_retry`]; the subscription
/// loop keeps reconnecting until stopped.
///
/// [`SyncEngine::sync_with_retry`]: crate::SyncEngine::sync_with_retry
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts of a one-shot sync, the first one included.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Cap before jitter.
    pub max_delay: Duration,
    /// Growth per further failure.
    pub factor: u32,
    /// Largest random extra, as a fraction of the delay (0.0 to 1.0).
    pub jitter: f64,
}

impl RetryConfig {
    /// `max_attempts` attempts, 100ms doubling up to 30s, 25% jitter.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            factor: 2,
            jitter: 0.25,
        }
    }

    /// Sets the delay after the first failure.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor (at least 1).
    #[must_use]
    pub fn with_factor(mut self, factor: u32) -> Self {
        self.factor = factor.max(1);
        self
    }

    /// Sets the jitter fraction, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait after `failures` consecutive failures.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let growth = self.factor.checked_pow(failures - 1).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(growth)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay));
        if self.jitter > 0.0 && !capped.is_zero() {
            capped + capped.mul_f64(self.jitter * rand::thread_rng().gen::<f64>())
        } else {
            capped
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
