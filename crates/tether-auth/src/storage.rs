//! Durable, atomic credential persistence for one agent identity.
//!
//! Layout of a token directory:
//!
//! ```text
//! <dir>/tokens-<unix_ms>.json              written by this client
//! <dir>/client_info.json                   optional client registration
//! <dir>/mcp-remote-<ver>/<hash>_tokens.json        legacy token files
//! <dir>/mcp-remote-<ver>/<hash>_client_info.json   legacy client registration
//! ```
//!
//! Every token file is a candidate; the most recently modified one that
//! parses wins. Writes go to a hidden temp file, are fsynced, and are renamed
//! into place so a concurrent reader never sees a partial record.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::AuthError;
use crate::types::{Credential, DEFAULT_ASSUMED_LIFETIME_SECS};

const TOKEN_FILE_PREFIX: &str = "tokens-";
const LEGACY_DIR_PREFIX: &str = "mcp-remote-";
const LEGACY_TOKEN_SUFFIX: &str = "_tokens.json";
const CLIENT_INFO_FILE: &str = "client_info.json";
const LEGACY_CLIENT_INFO_SUFFIX: &str = "_client_info.json";
const REVOKED_SUFFIX: &str = ".revoked";

/// Token files of this client kept after a save.
pub const KEEP_GENERATIONS: usize = 3;

/// On-disk token record.
#[derive(Debug, Serialize, Deserialize)]
struct StoredToken {
    access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    expires_at: i64,
    expires_in: i64,
    refreshed_at: i64,
}

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    modified: SystemTime,
}

/// Credential files for one agent identity.
#[derive(Clone, Debug)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    /// Store rooted at an explicit directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store for `agent_name` under a shared root (`<root>/<agent_name>`).
    #[must_use]
    pub fn for_agent(root: &Path, agent_name: &str) -> Self {
        let safe: String = agent_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Self::new(root.join(safe))
    }

    /// Directory holding the token files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the newest valid credential. `Ok(None)` when there is none.
    ///
    /// Creates the directory if absent. Unreadable or malformed files are
    /// skipped with a warning.
    pub fn load(&self) -> Result<Option<Credential>, AuthError> {
        fs::create_dir_all(&self.dir)?;
        for candidate in self.candidates()? {
            let data = match fs::read_to_string(&candidate.path) {
                Ok(d) => d,
                Err(e) => {
                    warn!(path = %candidate.path.display(), error = %e, "failed to read token file");
                    continue;
                }
            };
            if let Some(cred) = parse_credential(&data, candidate.modified) {
                debug!(path = %candidate.path.display(), expires_at = %cred.expires_at, "loaded credential");
                return Ok(Some(cred));
            }
            warn!(path = %candidate.path.display(), "skipping invalid token file");
        }
        Ok(None)
    }

    /// Persist a credential as a new timestamped file.
    ///
    /// Older generations beyond [`KEEP_GENERATIONS`] are removed afterwards.
    pub fn save(&self, credential: &Credential) -> Result<PathBuf, AuthError> {
        fs::create_dir_all(&self.dir)?;

        let now = Utc::now();
        let record = StoredToken {
            access_token: credential.access_token.clone(),
            refresh_token: credential.refresh_token.clone(),
            token_type: "Bearer".to_string(),
            scope: credential.scope.clone(),
            expires_at: credential.expires_at.timestamp(),
            expires_in: (credential.expires_at - now).num_seconds().max(0),
            refreshed_at: now.timestamp(),
        };
        let json = serde_json::to_vec_pretty(&record)?;

        // Stamps only move forward so the newest generation always sorts last.
        let mut stamp = self
            .native_stamps()
            .into_iter()
            .map(|(s, _)| s.saturating_add(1))
            .max()
            .map_or(now.timestamp_millis(), |next| next.max(now.timestamp_millis()));
        let path = loop {
            let p = self.dir.join(format!("{TOKEN_FILE_PREFIX}{stamp}.json"));
            if !p.exists() {
                break p;
            }
            stamp += 1;
        };
        let tmp = self.dir.join(format!(".{TOKEN_FILE_PREFIX}{stamp}.json.tmp"));

        {
            let mut file = fs::File::create(&tmp)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
            }
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        info!(path = %path.display(), expires_at = %credential.expires_at, "saved credential");
        self.prune_generations(&path);
        Ok(path)
    }

    /// Retire every token file so the next load finds nothing.
    ///
    /// Files are renamed with a `.revoked` suffix rather than deleted.
    pub fn invalidate(&self) -> Result<usize, AuthError> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut retired = 0;
        for candidate in self.candidates()? {
            let mut target = candidate.path.clone().into_os_string();
            target.push(REVOKED_SUFFIX);
            fs::rename(&candidate.path, PathBuf::from(target))?;
            retired += 1;
        }
        warn!(dir = %self.dir.display(), retired, "invalidated stored credentials");
        Ok(retired)
    }

    /// Client id from `client_info.json` or a legacy `*_client_info.json`.
    ///
    /// Falls back to `client_name` when `client_id` is absent.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        let mut files = vec![self.dir.join(CLIENT_INFO_FILE)];
        for sub in self.legacy_dirs() {
            files.extend(files_with_suffix(&sub, LEGACY_CLIENT_INFO_SUFFIX));
        }
        files.iter().find_map(|path| {
            let data = fs::read_to_string(path).ok()?;
            let v: Value = serde_json::from_str(&data).ok()?;
            ["client_id", "client_name"]
                .iter()
                .find_map(|k| v.get(*k).and_then(Value::as_str).filter(|s| !s.is_empty()))
                .map(str::to_string)
        })
    }

    fn candidates(&self) -> Result<Vec<Candidate>, AuthError> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_file() && is_native_token_file(&name) {
                paths.push(entry.path());
            }
        }
        for sub in self.legacy_dirs() {
            paths.extend(files_with_suffix(&sub, LEGACY_TOKEN_SUFFIX));
        }

        let mut candidates: Vec<Candidate> = paths
            .into_iter()
            .filter_map(|path| {
                let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some(Candidate { path, modified })
            })
            .collect();
        candidates.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
        Ok(candidates)
    }

    fn legacy_dirs(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter(|e| e.file_name().to_string_lossy().starts_with(LEGACY_DIR_PREFIX))
            .map(|e| e.path())
            .collect()
    }

    /// Stamp and path of every native token file.
    fn native_stamps(&self) -> Vec<(i64, PathBuf)> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|e| {
                let stamp = native_stamp(&e.file_name().to_string_lossy())?;
                Some((stamp, e.path()))
            })
            .collect()
    }

    fn prune_generations(&self, written: &Path) {
        let mut native = self.native_stamps();
        native.sort_by(|a, b| b.cmp(a));
        for (_, old) in native.into_iter().skip(KEEP_GENERATIONS) {
            if old == written {
                continue;
            }
            if let Err(e) = fs::remove_file(&old) {
                warn!(path = %old.display(), error = %e, "failed to remove old token file");
            }
        }
    }
}

fn is_native_token_file(name: &str) -> bool {
    name.starts_with(TOKEN_FILE_PREFIX) && name.ends_with(".json")
}

/// Millisecond stamp of a `tokens-<ms>.json` name.
fn native_stamp(name: &str) -> Option<i64> {
    name.strip_prefix(TOKEN_FILE_PREFIX)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .filter(|e| e.file_name().to_string_lossy().ends_with(suffix))
        .map(|e| e.path())
        .collect()
}

/// Parse a token file body. `modified` anchors relative lifetimes.
fn parse_credential(data: &str, modified: SystemTime) -> Option<Credential> {
    let v: Value = serde_json::from_str(data).ok()?;
    let access_token = v
        .get("access_token")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())?
        .to_string();
    let text = |key: &str| {
        v.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    Some(Credential {
        access_token,
        refresh_token: text("refresh_token"),
        expires_at: resolve_expiry(&v, modified)?,
        scope: text("scope"),
    })
}

/// Expiry from `expires_at`, else `refreshed_at`/`issued_at` (or the file
/// mtime) plus `expires_in` (or the assumed lifetime).
///
/// `None` when the lifetime does not fit the representable date range.
fn resolve_expiry(v: &Value, modified: SystemTime) -> Option<DateTime<Utc>> {
    if let Some(at) = v.get("expires_at").and_then(parse_instant) {
        return Some(at);
    }
    let lifetime = v
        .get("expires_in")
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_ASSUMED_LIFETIME_SECS);
    let issued = ["refreshed_at", "issued_at"]
        .iter()
        .find_map(|k| v.get(*k).and_then(parse_instant))
        .unwrap_or_else(|| DateTime::<Utc>::from(modified));
    TimeDelta::try_seconds(lifetime).and_then(|d| issued.checked_add_signed(d))
}

/// Epoch seconds, epoch milliseconds, numeric string, or RFC 3339.
fn parse_instant(v: &Value) -> Option<DateTime<Utc>> {
    let from_number = |n: f64| {
        #[allow(clippy::cast_possible_truncation)]
        let n = n as i64;
        // Anything past year 5138 in seconds is taken as milliseconds.
        if n > 100_000_000_000 {
            DateTime::from_timestamp_millis(n)
        } else {
            DateTime::from_timestamp(n, 0)
        }
    };
    match v {
        Value::Number(n) => n.as_f64().and_then(from_number),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().and_then(from_number)),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
