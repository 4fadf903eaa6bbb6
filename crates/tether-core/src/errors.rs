//! Fatal error kinds.
//!
//! Everything that is not listed here is recovered locally by the
//! supervisor. When a session halts in `Failed`, the distinguishing
//! [`ErrorKind`] is part of the final message.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a session halted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The refresh token was rejected or no credential could be obtained.
    AuthUnrecoverable,
    /// Too many consecutive failures.
    BackoffExhausted,
    /// Local persistence (token directory, dedup database) failed.
    Storage,
}

impl ErrorKind {
    /// Stable name used in logs and exit messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthUnrecoverable => "auth_unrecoverable",
            Self::BackoffExhausted => "backoff_exhausted",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
