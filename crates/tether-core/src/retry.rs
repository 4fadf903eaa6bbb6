//! Bounded exponential backoff.
//!
//! - [`BackoffPolicy`]: min/max interval and consecutive-failure cap
//! - [`calculate_backoff_delay`]: `min(max, min_delay * 2^attempt)`
//! - [`Backoff`]: per-session failure counter producing [`BackoffStep`]s
//!
//! There is no jitter: one session never competes with itself, and the
//! delay sequence stays non-decreasing until a success resets it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default minimum backoff interval in milliseconds.
pub const DEFAULT_MIN_DELAY_MS: u64 = 2_000;
/// Default maximum backoff interval in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default number of consecutive failures tolerated before giving up.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Backoff parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// First delay after a failure.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// Delay cap.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Failures in a row after which the session fails. `0` disables the cap.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_min_delay_ms() -> u64 {
    DEFAULT_MIN_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_max_consecutive_failures() -> u32 {
    DEFAULT_MAX_CONSECUTIVE_FAILURES
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_delay_ms: DEFAULT_MIN_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

/// Exponential delay for a zero-based attempt index, capped at `max_delay_ms`.
#[must_use]
pub fn calculate_backoff_delay(attempt: u32, min_delay_ms: u64, max_delay_ms: u64) -> u64 {
    min_delay_ms
        .saturating_mul(1u64 << attempt.min(31))
        .min(max_delay_ms)
}

/// Outcome of recording a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffStep {
    /// Sleep this long, then retry.
    Delay(Duration),
    /// The consecutive-failure cap was exceeded.
    Exhausted {
        /// Failures recorded, including this one.
        failures: u32,
    },
}

/// Failure counter for one session.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    consecutive_failures: u32,
}

impl Backoff {
    /// Start with zero failures.
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
        }
    }

    /// Record a failure and return what to do next.
    pub fn record_failure(&mut self) -> BackoffStep {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let cap = self.policy.max_consecutive_failures;
        if cap > 0 && self.consecutive_failures > cap {
            return BackoffStep::Exhausted {
                failures: self.consecutive_failures,
            };
        }
        BackoffStep::Delay(self.peek_delay(self.consecutive_failures - 1))
    }

    /// Delay the next failure would produce, without recording it.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        self.peek_delay(self.consecutive_failures)
    }

    /// Forget all failures.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Failures recorded since the last reset.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// The policy in use.
    #[must_use]
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    fn peek_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(calculate_backoff_delay(
            attempt,
            self.policy.min_delay_ms,
            self.policy.max_delay_ms,
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
