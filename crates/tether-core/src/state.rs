//! Session connection states.
//!
//! Exactly one [`ConnectionState`] is live per session and only the
//! reconnect supervisor moves it. `Failed` and `Stopped` are terminal.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of one agent session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not yet started.
    #[default]
    Disconnected,
    /// Obtaining or re-validating a credential.
    Authenticating,
    /// A wait call is in flight.
    Waiting,
    /// Dispatching the events of the last response.
    Processing,
    /// Sleeping before the next attempt.
    Backoff,
    /// Halted on a fatal error. The session must be restarted.
    Failed,
    /// Halted on operator shutdown or after the once-mode event.
    Stopped,
}

impl ConnectionState {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }

    /// Lowercase name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Authenticating => "authenticating",
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Backoff => "backoff",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Whether the state machine permits `self -> next`.
    ///
    /// Any non-terminal state may move to `Stopped` (shutdown) or `Failed`
    /// (fatal error).
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{
            Authenticating, Backoff, Disconnected, Failed, Processing, Stopped, Waiting,
        };
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Stopped | Failed)
                | (Disconnected | Backoff, Authenticating)
                | (Authenticating | Processing, Waiting)
                | (Authenticating | Waiting, Backoff)
                | (Waiting, Processing)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
