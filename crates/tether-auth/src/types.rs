//! Credential and OAuth configuration types.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Lifetime assumed when a token file carries no usable expiry.
pub const DEFAULT_ASSUMED_LIFETIME_SECS: i64 = 900;

/// Longest advertised lifetime taken at face value (one year).
pub const MAX_ACCEPTED_LIFETIME_SECS: i64 = 365 * 24 * 3600;

/// Client id sent when neither configuration nor the token directory supply one.
pub const FALLBACK_CLIENT_ID: &str = "MCP CLI Proxy";

/// An access/refresh token pair with its expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Bearer token presented to the message service.
    pub access_token: String,
    /// Token used to obtain a new access token.
    pub refresh_token: Option<String>,
    /// Instant after which the access token must not be used.
    pub expires_at: DateTime<Utc>,
    /// Granted scope, space separated.
    pub scope: Option<String>,
}

impl Credential {
    /// Whether the credential is within `margin` of expiry.
    ///
    /// A credential whose remaining lifetime is zero or negative always
    /// needs refresh, whatever the margin.
    #[must_use]
    pub fn needs_refresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        let remaining = self.expires_at - now;
        if remaining <= chrono::Duration::zero() {
            return true;
        }
        match chrono::Duration::from_std(margin) {
            Ok(margin) => remaining <= margin,
            Err(_) => true,
        }
    }

    /// Time left before `expires_at`, zero when already expired.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Build from a token endpoint response received at `now`.
    ///
    /// Keeps `previous_refresh` when the server did not rotate the refresh token.
    /// The advertised lifetime is clamped to `0..=MAX_ACCEPTED_LIFETIME_SECS`.
    #[must_use]
    pub fn from_response(
        resp: TokenResponse,
        now: DateTime<Utc>,
        previous_refresh: Option<String>,
    ) -> Self {
        let lifetime = resp
            .expires_in
            .unwrap_or(DEFAULT_ASSUMED_LIFETIME_SECS)
            .clamp(0, MAX_ACCEPTED_LIFETIME_SECS);
        let expires_at = TimeDelta::try_seconds(lifetime)
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        Self {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token.or(previous_refresh),
            expires_at,
            scope: resp.scope,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Body of a successful token endpoint response.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    /// New access token.
    pub access_token: String,
    /// Rotated refresh token, if the server issued one.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Advertised lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Granted scope.
    #[serde(default)]
    pub scope: Option<String>,
    /// Usually `Bearer`.
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Authorization service endpoints and client registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OAuthConfig {
    /// Authorization endpoint the user is sent to.
    pub authorize_url: String,
    /// Token endpoint for code exchange and refresh.
    pub token_url: String,
    /// Client id. Empty means: look it up in the token directory.
    pub client_id: String,
    /// Redirect URI registered for the client.
    pub redirect_uri: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Refresh when this close to expiry.
    pub refresh_margin: Duration,
}

impl OAuthConfig {
    /// Endpoints derived from the authorization service base URL
    /// (`{base}/oauth/authorize`, `{base}/oauth/token`).
    #[must_use]
    pub fn from_base_url(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            authorize_url: format!("{base}/oauth/authorize"),
            token_url: format!("{base}/oauth/token"),
            client_id: String::new(),
            redirect_uri: "urn:ietf:wg:oauth:2.0:oob".to_string(),
            scopes: Vec::new(),
            refresh_margin: Duration::from_secs(60),
        }
    }

    /// Set the refresh margin.
    #[must_use]
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Set the client id.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
