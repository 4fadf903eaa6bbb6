//! `tracing` subscriber setup.

use tracing_subscriber::EnvFilter;

/// Install the global stderr subscriber.
///
/// `RUST_LOG` takes precedence over `level`. With `json` set, each record is
/// a single JSON line; otherwise the compact human format is used. Later
/// calls are no-ops.
pub fn init_subscriber(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // set_global_default fails if a subscriber is already installed
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        init_subscriber("debug", false);
        init_subscriber("info", true);
        tracing::info!("subscriber installed");
    }
}
