//! Transport and protocol error types.

use std::time::Duration;

/// The wait call did not complete at the HTTP level. Triggers backoff.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The server rejected the access token.
    #[error("unauthorized (401)")]
    Unauthorized,

    /// Non-success HTTP status other than 401.
    #[error("HTTP {status}: {message}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body, possibly truncated.
        message: String,
    },

    /// The MCP session id is no longer known to the server.
    #[error("MCP session expired")]
    SessionExpired,

    /// The server refused the `initialize` handshake.
    #[error("MCP handshake failed: {0}")]
    Handshake(String),

    /// The call exceeded its local deadline.
    #[error("wait call timed out after {0:?}")]
    Timeout(Duration),

    /// Connection, TLS, or body read failure.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// The response arrived but could not be decoded. Logged, treated as no events.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Body or payload is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON-RPC error member.
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message.
        message: String,
    },

    /// The tool reported `isError`.
    #[error("tool error: {0}")]
    Tool(String),

    /// No response with the request id was found in the body.
    #[error("no response for request {0}")]
    MissingResponse(u64),

    /// The payload matched none of the known shapes.
    #[error("unrecognized payload shape: {0}")]
    UnknownShape(String),
}

/// Failure of one wait call.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// HTTP-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Decoding failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl WaitError {
    /// Whether the server rejected the credential.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Unauthorized))
    }
}

impl From<reqwest::Error> for WaitError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(TransportError::Request(e))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
