//! Framework-neutral HTTP request/response types.
//!
//! The replication server and client exchange these values; binding them to
//! a concrete HTTP stack is left to the embedding application.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::NodeId;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Endpoint paths.
pub mod endpoints {
    /// Opens the SSE subscription stream.
    pub const CONNECT: &str = "/replication/connect";
    /// Pulls pending entities of one table.
    pub const PULL: &str = "/replication/pull";
    /// Pushes a batch of entities.
    pub const PUSH: &str = "/replication/push";
    /// Acknowledges applied versions.
    pub const ACK: &str = "/replication/ack";
}

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET.
    Get,
    /// POST.
    Post,
}

/// The `(nodeId, authToken)` pair every request carries.
#[derive(Clone, PartialEq, Eq)]
pub struct NodeCredentials {
    /// Calling node.
    pub node_id: NodeId,
    /// The node's auth token.
    pub auth_token: String,
}

impl std::fmt::Debug for NodeCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCredentials")
            .field("node_id", &self.node_id)
            .field("auth_token", &"<redacted>")
            .finish()
    }
}

impl NodeCredentials {
    /// Header carrying the node id.
    pub const NODE_HEADER: &'static str = "door-node";
    /// Header carrying the auth token.
    pub const AUTH_HEADER: &'static str = "door-auth";

    /// Creates credentials.
    pub fn new(node_id: NodeId, auth_token: impl Into<String>) -> Self {
        Self {
            node_id,
            auth_token: auth_token.into(),
        }
    }

    /// Reads credentials from request headers.
    pub fn from_request(request: &HttpRequest) -> ProtocolResult<Self> {
        let node_id = request
            .header(Self::NODE_HEADER)
            .and_then(|v| v.trim().parse().ok())
            .ok_or(ProtocolError::MissingHeader(Self::NODE_HEADER))?;
        let auth_token = request
            .header(Self::AUTH_HEADER)
            .filter(|v| !v.is_empty())
            .ok_or(ProtocolError::MissingHeader(Self::AUTH_HEADER))?;
        Ok(Self::new(node_id, auth_token))
    }
}

/// An HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Path, without scheme or host.
    pub path: String,
    /// Headers as `(name, value)` pairs.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Creates a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Creates a POST request.
    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            ..Self::get(path)
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Adds the node credential headers.
    #[must_use]
    pub fn with_credentials(self, credentials: &NodeCredentials) -> Self {
        self.with_header(NodeCredentials::NODE_HEADER, credentials.node_id.to_string())
            .with_header(NodeCredentials::AUTH_HEADER, credentials.auth_token.clone())
    }

    /// Sets a JSON body.
    pub fn with_json<T: Serialize>(mut self, body: &T) -> ProtocolResult<Self> {
        self.body = serde_json::to_vec(body)?;
        Ok(self.with_header("content-type", "application/json"))
    }

    /// Looks up a header, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Decodes the JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> ProtocolResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// An HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A 200 response with a JSON body.
    pub fn ok_json<T: Serialize>(body: &T) -> ProtocolResult<Self> {
        Ok(Self {
            status: 200,
            body: serde_json::to_vec(body)?,
        })
    }

    /// An error response with a plain-text message.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: message.into().into_bytes(),
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decodes the JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> ProtocolResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// The body as lossy UTF-8, for error messages.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
