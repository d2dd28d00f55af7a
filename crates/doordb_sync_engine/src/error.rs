//! Errors seen by a replicating client.
//!
//! Callers mostly care whether an error is worth another connection attempt;
//! see [`SyncError::is_retryable`].

use doordb_core::CoreError;
use doordb_sync_protocol::ProtocolError;
use thiserror::Error;

/// Result alias for the engine.
pub type SyncResult<T> = Result<T, SyncError>;

/// Failure of a replication step.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The request never got an answer, or the stream broke.
    #[error("connection to sync server failed: {message}")]
    Transport {
        /// What the HTTP stack reported.
        message: String,
        /// False for failures a reconnect cannot fix.
        retryable: bool,
    },

    /// Malformed message or stream.
    #[error("unexpected data from sync server: {0}")]
    Protocol(String),

    /// The server rejected this node's credentials.
    #[error("sync server rejected node credentials: {0}")]
    AuthenticationFailed(String),

    /// The server answered with an error status.
    #[error("sync server answered {status}: {message}")]
    Server {
        /// HTTP status.
        status: u16,
        /// Response body.
        message: String,
    },

    /// Reading or applying rows locally failed.
    #[error("local database: {0}")]
    Database(#[from] CoreError),

    /// Invalid client configuration.
    #[error("invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// No response within the configured request timeout.
    #[error("sync request timed out")]
    Timeout,

    /// The engine was stopped.
    #[error("replication stopped")]
    Cancelled,
}

impl SyncError {
    /// A connection failure worth retrying.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// A connection failure that will not heal by itself.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Maps an error response to an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::AuthenticationFailed(message),
            _ => Self::Server { status, message },
        }
    }

    /// Whether reconnecting may succeed: lost connections, timeouts, 5xx and
    /// 429 answers, and retryable local errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::Server { status, .. } => *status >= 500 || *status == 429,
            SyncError::Database(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}
