//! Auth error types.

/// Errors that can occur while obtaining, refreshing, or persisting credentials.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// HTTP request failed before a response arrived.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The token endpoint answered with a non-success status.
    #[error("OAuth error ({status}): {message}")]
    OAuth {
        /// HTTP status code.
        status: u16,
        /// Response body or error description.
        message: String,
    },

    /// A refresh is needed but the credential has no refresh token.
    #[error("credential has no refresh token")]
    MissingRefreshToken,

    /// The authorization server rejected the refresh token. Stays in effect
    /// until re-authorization is requested explicitly.
    #[error("credential revoked: {0}")]
    Revoked(String),

    /// No credential exists and the authorization step did not produce one.
    #[error("authorization failed: {0}")]
    NotAuthorized(String),

    /// Endpoint or client configuration is unusable.
    #[error("invalid auth configuration: {0}")]
    Config(String),
}

impl AuthError {
    /// Whether retrying cannot help and fresh authorization is required.
    ///
    /// Rejected refresh tokens (400/401/403, `invalid_grant`), a missing
    /// refresh token, and failed authorization are unrecoverable. Network
    /// errors, timeouts, 429, and 5xx are transient.
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            Self::OAuth { status, message } => {
                matches!(status, 400 | 401 | 403) || message.contains("invalid_grant")
            }
            Self::MissingRefreshToken
            | Self::Revoked(_)
            | Self::NotAuthorized(_)
            | Self::Config(_) => true,
            Self::Http(_) | Self::Json(_) | Self::Io(_) => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
