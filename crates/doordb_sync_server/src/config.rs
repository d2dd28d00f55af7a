//! Server configuration.

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of entities returned by one pull.
    pub max_pull_batch: usize,
    /// Maximum number of entities accepted in one push.
    pub max_push_batch: usize,
    /// Buffered events per subscription stream before the subscriber is
    /// considered lagging and disconnected.
    pub sse_channel_capacity: usize,
    /// Register unknown nodes on their first request.
    pub trust_on_first_use: bool,
}

impl ServerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            max_pull_batch: 100,
            max_push_batch: 500,
            sse_channel_capacity: 64,
            trust_on_first_use: true,
        }
    }

    /// Sets the maximum pull batch size.
    #[must_use]
    pub fn with_max_pull_batch(mut self, size: usize) -> Self {
        self.max_pull_batch = size.max(1);
        self
    }

    /// Sets the maximum push batch size.
    #[must_use]
    pub fn with_max_push_batch(mut self, size: usize) -> Self {
        self.max_push_batch = size.max(1);
        self
    }

    /// Sets the per-subscriber event buffer.
    #[must_use]
    pub fn with_sse_channel_capacity(mut self, capacity: usize) -> Self {
        self.sse_channel_capacity = capacity.max(2);
        self
    }

    /// Enables or disables trust-on-first-use registration.
    #[must_use]
    pub fn with_trust_on_first_use(mut self, enabled: bool) -> Self {
        self.trust_on_first_use = enabled;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
