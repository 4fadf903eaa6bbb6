//! Durable record of processed event ids.
//!
//! Every id is kept in an in-memory set for lookups and in a small `SQLite`
//! table so the record survives restarts:
//!
//! ```sql
//! processed(event_id TEXT PRIMARY KEY, processed_at INTEGER)
//! ```
//!
//! Pruning drops rows older than the retention horizon and then trims the
//! oldest rows beyond the size cap, but never a row younger than the replay
//! window. An event the server could still replay is always remembered.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use tether_core::Event;
use tether_settings::DedupSettings;
use tracing::{debug, info};

use crate::errors::DedupError;

/// How long processed ids are kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Longest period over which the server may replay an event.
    pub replay_window: Duration,
    /// Rows older than this are pruned. Never shorter than the replay window.
    pub retention: Duration,
    /// Soft cap on rows.
    pub max_entries: usize,
}

impl From<&DedupSettings> for RetentionPolicy {
    fn from(s: &DedupSettings) -> Self {
        Self {
            replay_window: Duration::from_secs(s.replay_window_secs),
            retention: Duration::from_secs(s.retention_secs),
            max_entries: s.max_entries,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from(&DedupSettings::default())
    }
}

/// Remembers which events have been dispatched.
pub struct DedupTracker {
    conn: Connection,
    seen: HashSet<String>,
    policy: RetentionPolicy,
}

impl DedupTracker {
    /// Open (or create) the database at `path` and load its ids.
    pub fn open(path: &Path, policy: RetentionPolicy) -> Result<Self, DedupError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let tracker = Self::with_connection(conn, policy)?;
        debug!(path = %path.display(), entries = tracker.len(), "opened dedup store");
        Ok(tracker)
    }

    /// Non-persistent tracker.
    pub fn in_memory(policy: RetentionPolicy) -> Result<Self, DedupError> {
        Self::with_connection(Connection::open_in_memory()?, policy)
    }

    fn with_connection(conn: Connection, policy: RetentionPolicy) -> Result<Self, DedupError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;\
             PRAGMA busy_timeout = 5000;\
             PRAGMA synchronous = NORMAL;\
             CREATE TABLE IF NOT EXISTS processed (\
                 event_id TEXT PRIMARY KEY,\
                 processed_at INTEGER NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS idx_processed_at ON processed (processed_at);",
        )?;
        let mut tracker = Self {
            conn,
            seen: HashSet::new(),
            policy,
        };
        tracker.reload()?;
        Ok(tracker)
    }

    fn reload(&mut self) -> Result<(), DedupError> {
        let mut stmt = self.conn.prepare("SELECT event_id FROM processed")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        self.seen = ids;
        Ok(())
    }

    /// Whether `event` has not been processed yet.
    #[must_use]
    pub fn is_new(&self, event: &Event) -> bool {
        !self.contains(event.id.as_str())
    }

    /// Whether `event_id` is recorded.
    #[must_use]
    pub fn contains(&self, event_id: &str) -> bool {
        self.seen.contains(event_id)
    }

    /// Record `event` as processed now.
    pub fn mark_processed(&mut self, event: &Event) -> Result<(), DedupError> {
        self.mark_processed_at(event.id.as_str(), Utc::now())
    }

    /// Record `event_id` as processed at `at`. A second mark keeps the first time.
    pub fn mark_processed_at(&mut self, event_id: &str, at: DateTime<Utc>) -> Result<(), DedupError> {
        let _ = self.conn.execute(
            "INSERT OR IGNORE INTO processed (event_id, processed_at) VALUES (?1, ?2)",
            params![event_id, at.timestamp()],
        )?;
        let _ = self.seen.insert(event_id.to_string());
        Ok(())
    }

    /// Prune relative to the current time.
    pub fn prune(&mut self) -> Result<usize, DedupError> {
        self.prune_at(Utc::now())
    }

    /// Prune relative to `now`. Returns the number of rows removed.
    pub fn prune_at(&mut self, now: DateTime<Utc>) -> Result<usize, DedupError> {
        let now = now.timestamp();
        let replay_cutoff = now.saturating_sub(secs(self.policy.replay_window));
        let retention_cutoff =
            now.saturating_sub(secs(self.policy.retention.max(self.policy.replay_window)));

        let expired = self.conn.execute(
            "DELETE FROM processed WHERE processed_at < ?1",
            params![retention_cutoff],
        )?;

        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM processed", [], |row| row.get(0))?;
        let cap = i64::try_from(self.policy.max_entries).unwrap_or(i64::MAX);
        let trimmed = if count > cap {
            self.conn.execute(
                "DELETE FROM processed WHERE event_id IN (\
                     SELECT event_id FROM processed WHERE processed_at < ?1 \
                     ORDER BY processed_at ASC, event_id ASC LIMIT ?2)",
                params![replay_cutoff, count - cap],
            )?
        } else {
            0
        };

        let removed = expired + trimmed;
        if removed > 0 {
            self.reload()?;
            info!(expired, trimmed, remaining = self.len(), "pruned processed events");
        }
        Ok(removed)
    }

    /// Number of recorded ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Retention in use.
    #[must_use]
    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }
}

impl std::fmt::Debug for DedupTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupTracker")
            .field("entries", &self.len())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
