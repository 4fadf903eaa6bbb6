//! Settings type definitions.
//!
//! All types use camelCase JSON and `#[serde(default)]`, so a partial file
//! only overrides the fields it names.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::{BackoffPolicy, ListMode, WaitMode};

/// Root settings for one agent session.
///
/// ```json
/// {
///   "session": { "serverUrl": "https://example.net/mcp", "agentName": "scout" },
///   "wait": { "mode": "direct", "timeoutSecs": 300 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Endpoints, identity, and local paths.
    pub session: SessionSettings,
    /// Long-poll parameters.
    pub wait: WaitSettings,
    /// Credential handling.
    pub auth: AuthSettings,
    /// Stall detection.
    pub heartbeat: HeartbeatSettings,
    /// Reconnect backoff.
    pub backoff: BackoffPolicy,
    /// Processed-event retention.
    pub dedup: DedupSettings,
    /// Handler selection.
    pub handlers: HandlerSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// Endpoints, identity, and local paths.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// MCP endpoint of the message service.
    pub server_url: String,
    /// Base URL of the authorization service. Token endpoint is `{oauthUrl}/oauth/token`.
    /// Empty means the origin of `serverUrl`.
    pub oauth_url: String,
    /// Agent handle.
    pub agent_name: String,
    /// Token directory. Defaults to `~/.tether/tokens/<agentName>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_dir: Option<String>,
    /// Dedup database path. Defaults to `~/.tether/state/<agentName>.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_db: Option<String>,
}

impl SessionSettings {
    /// Token directory, falling back to the per-agent default under `home`.
    #[must_use]
    pub fn resolved_token_dir(&self, home: &std::path::Path) -> PathBuf {
        self.token_dir.as_ref().map_or_else(
            || home.join("tokens").join(&self.agent_name),
            PathBuf::from,
        )
    }

    /// Authorization base URL, falling back to the scheme and authority of `server_url`.
    #[must_use]
    pub fn resolved_oauth_url(&self) -> String {
        let explicit = self.oauth_url.trim();
        if !explicit.is_empty() {
            return explicit.trim_end_matches('/').to_string();
        }
        let server = self.server_url.trim();
        let authority_start = server.find("://").map_or(0, |i| i + 3);
        let end = server[authority_start..]
            .find('/')
            .map_or(server.len(), |i| authority_start + i);
        server[..end].to_string()
    }

    /// Dedup database path, falling back to the per-agent default under `home`.
    #[must_use]
    pub fn resolved_dedup_db(&self, home: &std::path::Path) -> PathBuf {
        self.dedup_db.as_ref().map_or_else(
            || home.join("state").join(format!("{}.db", self.agent_name)),
            PathBuf::from,
        )
    }
}

/// Long-poll parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WaitSettings {
    /// Wake condition.
    pub mode: WaitMode,
    /// Server-side blocking timeout in seconds.
    pub timeout_secs: u64,
    /// Maximum events per response.
    pub limit: u32,
    /// Inbox slice.
    pub list_mode: ListMode,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            mode: WaitMode::Mentions,
            timeout_secs: 120,
            limit: 10,
            list_mode: ListMode::Unread,
        }
    }
}

impl WaitSettings {
    /// Timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Credential handling.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// OAuth client id. Empty means: read it from the token directory.
    pub client_id: String,
    /// Redirect URI registered for the authorization-code flow.
    pub redirect_uri: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Refresh when this close to expiry, in seconds.
    pub refresh_margin_secs: u64,
    /// Run a background timer that refreshes ahead of expiry.
    pub proactive_refresh: bool,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            redirect_uri: "urn:ietf:wg:oauth:2.0:oob".to_string(),
            scopes: Vec::new(),
            refresh_margin_secs: 60,
            proactive_refresh: true,
        }
    }
}

impl AuthSettings {
    /// Refresh margin as a [`Duration`].
    #[must_use]
    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }
}

/// Stall detection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Declare a stall after this many seconds without a liveness signal.
    pub stall_threshold_secs: u64,
    /// How often the stall check runs, in seconds.
    pub check_interval_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            stall_threshold_secs: 180,
            check_interval_secs: 5,
        }
    }
}

impl HeartbeatSettings {
    /// Stall threshold as a [`Duration`].
    #[must_use]
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    /// Check interval as a [`Duration`].
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Processed-event retention.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DedupSettings {
    /// Longest period over which the server may replay an event, in seconds.
    pub replay_window_secs: u64,
    /// Records older than this are pruned, in seconds.
    pub retention_secs: u64,
    /// Soft cap on stored records. Never evicts records inside the replay window.
    pub max_entries: usize,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            replay_window_secs: 7 * 24 * 3600,
            retention_secs: 14 * 24 * 3600,
            max_entries: 10_000,
        }
    }
}

/// Handler selection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandlerSettings {
    /// Registry keys of the handlers to run, in order.
    pub keys: Vec<String>,
    /// Stop at the first handler that reports the event handled.
    pub chain: bool,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            keys: vec!["log".to_string()],
            chain: true,
        }
    }
}

/// Log output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn defaults() {
        let s = TetherSettings::default();
        assert_eq!(s.wait.timeout_secs, 120);
        assert_eq!(s.wait.mode, WaitMode::Mentions);
        assert_eq!(s.heartbeat.stall_threshold_secs, 180);
        assert_eq!(s.auth.refresh_margin_secs, 60);
        assert_eq!(s.backoff.min_delay_ms, 2_000);
        assert_eq!(s.handlers.keys, vec!["log"]);
        assert!(s.dedup.retention_secs > s.dedup.replay_window_secs);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let s: TetherSettings =
            serde_json::from_str(r#"{"wait": {"mode": "direct"}}"#).unwrap();
        assert_eq!(s.wait.mode, WaitMode::Direct);
        assert_eq!(s.wait.timeout_secs, 120);
    }

    #[test]
    fn oauth_url_defaults_to_server_origin() {
        let mut session = SessionSettings {
            server_url: "https://chat.example.com/mcp/v1".into(),
            ..SessionSettings::default()
        };
        assert_eq!(session.resolved_oauth_url(), "https://chat.example.com");
        session.server_url = "http://127.0.0.1:8080".into();
        assert_eq!(session.resolved_oauth_url(), "http://127.0.0.1:8080");
        session.oauth_url = "https://auth.example.com/".into();
        assert_eq!(session.resolved_oauth_url(), "https://auth.example.com");
    }

    #[test]
    fn json_is_camel_case() {
        let json = serde_json::to_value(TetherSettings::default()).unwrap();
        assert!(json["heartbeat"]["stallThresholdSecs"].is_u64());
        assert!(json["session"].get("tokenDir").is_none());
    }

    #[test]
    fn resolved_paths_default_per_agent() {
        let session = SessionSettings {
            agent_name: "scout".into(),
            ..SessionSettings::default()
        };
        let home = Path::new("/h/.tether");
        assert_eq!(
            session.resolved_token_dir(home),
            PathBuf::from("/h/.tether/tokens/scout")
        );
        assert_eq!(
            session.resolved_dedup_db(home),
            PathBuf::from("/h/.tether/state/scout.db")
        );
    }

    #[test]
    fn explicit_paths_win() {
        let session = SessionSettings {
            agent_name: "scout".into(),
            token_dir: Some("/tmp/t".into()),
            dedup_db: Some("/tmp/d.db".into()),
            ..SessionSettings::default()
        };
        let home = Path::new("/h");
        assert_eq!(session.resolved_token_dir(home), PathBuf::from("/tmp/t"));
        assert_eq!(session.resolved_dedup_db(home), PathBuf::from("/tmp/d.db"));
    }
}
