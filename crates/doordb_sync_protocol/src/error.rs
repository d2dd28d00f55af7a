//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while encoding or decoding protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON body could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An SSE frame was malformed.
    #[error("invalid sse frame: {0}")]
    InvalidFrame(String),

    /// An SSE frame had an event type this protocol does not know.
    #[error("unknown sse event: {0}")]
    UnknownEvent(String),

    /// A required header was absent or unparsable.
    #[error("missing or invalid header: {0}")]
    MissingHeader(&'static str),
}

impl ProtocolError {
    /// Creates an invalid frame error.
    pub fn invalid_frame(message: impl Into<String>) -> Self {
        Self::InvalidFrame(message.into())
    }
}
