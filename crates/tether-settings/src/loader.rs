//! Settings loading with deep merge, environment overrides, and validation.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `TETHER_*` environment variable overrides
//! 4. The caller applies CLI flags, then calls [`validate`]
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::TetherSettings;

/// Longest server-side wait accepted, in seconds.
const MAX_WAIT_TIMEOUT_SECS: u64 = 600;

/// Resolve the tether home directory (`~/.tether`).
pub fn tether_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether")
}

/// Resolve the path to the settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    tether_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error. Validation is
/// left to the caller so CLI flags can still fill required fields.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TETHER_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable lookup.
///
/// Invalid values are logged and ignored, keeping the file/default value.
pub(crate) fn apply_overrides_from<F>(settings: &mut TetherSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Session ─────────────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_SERVER_URL") {
        settings.session.server_url = v;
    }
    if let Some(v) = env.string("TETHER_OAUTH_URL") {
        settings.session.oauth_url = v;
    }
    if let Some(v) = env.string("TETHER_AGENT_NAME") {
        settings.session.agent_name = v;
    }
    if let Some(v) = env.string("TETHER_TOKEN_DIR") {
        settings.session.token_dir = Some(v);
    }
    if let Some(v) = env.string("TETHER_DEDUP_DB") {
        settings.session.dedup_db = Some(v);
    }

    // ── Wait ────────────────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_WAIT_MODE") {
        match v.parse() {
            Ok(mode) => settings.wait.mode = mode,
            Err(e) => tracing::warn!(key = "TETHER_WAIT_MODE", error = %e, "ignoring env var"),
        }
    }
    if let Some(v) = env.u64("TETHER_WAIT_TIMEOUT_SECS", 1, MAX_WAIT_TIMEOUT_SECS) {
        settings.wait.timeout_secs = v;
    }

    // ── Auth / heartbeat ────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_CLIENT_ID") {
        settings.auth.client_id = v;
    }
    if let Some(v) = env.u64("TETHER_REFRESH_MARGIN_SECS", 0, 86_400) {
        settings.auth.refresh_margin_secs = v;
    }
    if let Some(v) = env.u64("TETHER_STALL_THRESHOLD_SECS", 1, 86_400) {
        settings.heartbeat.stall_threshold_secs = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("TETHER_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Check required fields and cross-field constraints.
pub fn validate(settings: &TetherSettings) -> Result<()> {
    let invalid = |msg: String| -> Result<()> { Err(SettingsError::InvalidValue(msg)) };

    if settings.session.server_url.trim().is_empty() {
        return invalid("session.serverUrl is required".into());
    }
    if settings.session.agent_name.trim().is_empty() {
        return invalid("session.agentName is required".into());
    }
    let wait = settings.wait.timeout_secs;
    if wait == 0 || wait > MAX_WAIT_TIMEOUT_SECS {
        return invalid(format!(
            "wait.timeoutSecs must be within 1..={MAX_WAIT_TIMEOUT_SECS}, got {wait}"
        ));
    }
    let stall = settings.heartbeat.stall_threshold_secs;
    if stall <= wait {
        return invalid(format!(
            "heartbeat.stallThresholdSecs ({stall}) must exceed wait.timeoutSecs ({wait})"
        ));
    }
    if settings.heartbeat.check_interval_secs == 0 {
        return invalid("heartbeat.checkIntervalSecs must be positive".into());
    }
    let backoff = &settings.backoff;
    if backoff.min_delay_ms == 0 || backoff.min_delay_ms > backoff.max_delay_ms {
        return invalid(format!(
            "backoff range {}..{} ms is empty",
            backoff.min_delay_ms, backoff.max_delay_ms
        ));
    }
    let dedup = &settings.dedup;
    if dedup.retention_secs < dedup.replay_window_secs {
        return invalid(format!(
            "dedup.retentionSecs ({}) must be at least dedup.replayWindowSecs ({})",
            dedup.retention_secs, dedup.replay_window_secs
        ));
    }
    if settings.handlers.keys.is_empty() {
        return invalid("handlers.keys must name at least one handler".into());
    }
    Ok(())
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, min, max, "invalid u64 env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
