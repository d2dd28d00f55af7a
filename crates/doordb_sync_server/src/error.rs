//! Error types for the sync server.

use doordb_core::{CoreError, NodeId, TableId};
use doordb_sync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed or out-of-policy request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Credentials did not match the registered node.
    #[error("authentication rejected for node {node_id}")]
    AuthRejected {
        /// Node that failed to authenticate.
        node_id: NodeId,
    },

    /// No route for the request path.
    #[error("not found: {0}")]
    NotFound(String),

    /// The table id is not replicable on this server.
    #[error("unknown table: {0}")]
    UnknownTable(TableId),

    /// The server has been shut down.
    #[error("server closed")]
    Closed,

    /// Request or response body could not be processed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Error from the local database.
    #[error("database error: {0}")]
    Database(CoreError),
}

impl From<CoreError> for ServerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::AuthRejected { node_id } => ServerError::AuthRejected { node_id },
            CoreError::UnknownTable(table_id) => ServerError::UnknownTable(table_id),
            CoreError::Closed => ServerError::Closed,
            CoreError::InvalidEntity { .. } | CoreError::InvalidOperation { .. } => {
                ServerError::InvalidRequest(err.to_string())
            }
            other => ServerError::Database(other),
        }
    }
}

impl ServerError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Protocol(_) => 400,
            ServerError::AuthRejected { .. } => 401,
            ServerError::NotFound(_) | ServerError::UnknownTable(_) => 404,
            ServerError::Closed => 503,
            ServerError::Database(err) if err.is_retryable() => 503,
            ServerError::Database(_) => 500,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }

    /// Returns true if the client may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        self.status_code() == 503
    }
}
