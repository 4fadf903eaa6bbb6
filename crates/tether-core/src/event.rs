//! Normalized events and wait requests.
//!
//! Whatever shape the remote service answers with, the transport decodes it
//! into a list of [`Event`] values. Only [`Event::id`] takes part in
//! deduplication; every other field is payload.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::EventId;

/// Upper bound on a single server-side wait.
pub const MAX_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Default number of events requested per wait call.
pub const DEFAULT_WAIT_LIMIT: u32 = 10;

/// A single event received from the remote service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Canonical event id.
    pub id: EventId,
    /// Display name or handle of the sender, if present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Text body.
    pub body: String,
    /// Server timestamp, kept verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Space or channel reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space: Option<String>,
    /// The undecoded item as received.
    #[serde(default)]
    pub raw: Value,
}

impl Event {
    /// Build an event with only an id and a body.
    #[must_use]
    pub fn new(id: impl Into<EventId>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sender: None,
            body: body.into(),
            timestamp: None,
            space: None,
            raw: Value::Null,
        }
    }

    /// Set the sender.
    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }
}

/// Which events the server should wake the wait call for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitMode {
    /// Events that mention this agent.
    #[default]
    Mentions,
    /// Events flagged urgent.
    Urgent,
    /// Events assigned to this agent.
    Assigned,
    /// Direct messages.
    Direct,
    /// Every event.
    All,
}

impl WaitMode {
    /// Wire name of the mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mentions => "mentions",
            Self::Urgent => "urgent",
            Self::Assigned => "assigned",
            Self::Direct => "direct",
            Self::All => "all",
        }
    }
}

impl fmt::Display for WaitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WaitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mentions" => Ok(Self::Mentions),
            "urgent" => Ok(Self::Urgent),
            "assigned" => Ok(Self::Assigned),
            "direct" => Ok(Self::Direct),
            "all" => Ok(Self::All),
            other => Err(format!("unknown wait mode: {other}")),
        }
    }
}

/// Which slice of the inbox the server returns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListMode {
    /// Only events not yet marked read server-side.
    #[default]
    Unread,
    /// The most recent events regardless of read state.
    Latest,
}

impl ListMode {
    /// Wire name of the mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unread => "unread",
            Self::Latest => "latest",
        }
    }
}

impl FromStr for ListMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "unread" => Ok(Self::Unread),
            "latest" => Ok(Self::Latest),
            other => Err(format!("unknown list mode: {other}")),
        }
    }
}

/// Parameters of one blocking wait call. Built fresh per call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaitRequest {
    /// Wake condition.
    pub wait_mode: WaitMode,
    /// Server-side blocking timeout, at most [`MAX_WAIT_TIMEOUT`].
    pub timeout: Duration,
    /// Id of the newest event already seen, if any.
    pub since: Option<EventId>,
    /// Maximum events per response.
    pub limit: u32,
    /// Inbox slice.
    pub list_mode: ListMode,
}

impl WaitRequest {
    /// Create a request; the timeout is clamped to [`MAX_WAIT_TIMEOUT`].
    #[must_use]
    pub fn new(wait_mode: WaitMode, timeout: Duration) -> Self {
        Self {
            wait_mode,
            timeout: timeout.min(MAX_WAIT_TIMEOUT),
            since: None,
            limit: DEFAULT_WAIT_LIMIT,
            list_mode: ListMode::default(),
        }
    }

    /// Set the since-cursor.
    #[must_use]
    pub fn with_since(mut self, since: Option<EventId>) -> Self {
        self.since = since;
        self
    }

    /// Set the per-response limit (at least 1).
    #[must_use]
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Set the list mode.
    #[must_use]
    pub fn with_list_mode(mut self, list_mode: ListMode) -> Self {
        self.list_mode = list_mode;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
