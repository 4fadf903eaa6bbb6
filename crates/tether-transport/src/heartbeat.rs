//! Stall detection for the long-lived wait call.
//!
//! The transport ticks the monitor whenever the connection shows a sign of
//! life: a call starting, a response header, a body chunk. A watcher polls
//! the monitor and reports a stall once nothing has ticked for longer than
//! the threshold. Detection is at most one check interval late.
//!
//! Silence is measured on the monotonic clock ([`tokio::time::Instant`]),
//! which does not advance while the host is suspended. After a resume the
//! time spent asleep does not count, so a connection that died during
//! suspend is reported only after another full threshold of silence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Outcome of [`HeartbeatMonitor::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No tick for longer than the threshold.
    Stalled {
        /// Time since the last tick when the stall was noticed.
        silent_for: Duration,
    },
    /// The watcher was cancelled externally.
    Cancelled,
}

/// Records liveness ticks and judges whether the connection has stalled.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    last_tick: Mutex<Instant>,
    threshold: Duration,
    ticks: AtomicU64,
}

impl HeartbeatMonitor {
    /// Create a monitor that considers the connection stalled after `threshold` of silence.
    #[must_use]
    pub fn new(threshold: Duration) -> Self {
        Self {
            last_tick: Mutex::new(Instant::now()),
            threshold,
            ticks: AtomicU64::new(0),
        }
    }

    /// Record a sign of life.
    pub fn tick(&self) {
        *self.last_tick.lock() = Instant::now();
        let _ = self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Time elapsed since the most recent tick.
    #[must_use]
    pub fn since_last_tick(&self) -> Duration {
        self.last_tick.lock().elapsed()
    }

    /// Whether the silence has exceeded the threshold.
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.since_last_tick() > self.threshold
    }

    /// Configured stall threshold.
    #[must_use]
    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Number of ticks recorded so far.
    #[must_use]
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Poll every `check_interval` until a stall is seen or `cancel` fires.
    pub async fn watch(&self, check_interval: Duration, cancel: CancellationToken) -> HeartbeatResult {
        let period = check_interval.max(Duration::from_millis(1));
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let silent_for = self.since_last_tick();
                    if silent_for > self.threshold {
                        return HeartbeatResult::Stalled { silent_for };
                    }
                }
                () = cancel.cancelled() => {
                    return HeartbeatResult::Cancelled;
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
