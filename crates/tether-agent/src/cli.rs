//! Command-line flags. Flags win over the settings file and environment.

use std::path::PathBuf;

use clap::Parser;
use tether_core::WaitMode;
use tether_settings::TetherSettings;

/// Keep one agent connected to the message service.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Keep one agent connected to the message service")]
pub struct Cli {
    /// Settings file (default: `~/.tether/settings.json`).
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// MCP endpoint of the message service.
    #[arg(long)]
    pub server: Option<String>,

    /// Authorization service base URL.
    #[arg(long)]
    pub oauth: Option<String>,

    /// Agent handle.
    #[arg(long)]
    pub agent: Option<String>,

    /// Token directory.
    #[arg(long)]
    pub token_dir: Option<PathBuf>,

    /// Wake condition: mentions, urgent, assigned, direct, or all.
    #[arg(long)]
    pub wait_mode: Option<WaitMode>,

    /// Server-side wait timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Handler key to run; repeat for several.
    #[arg(long = "handler")]
    pub handlers: Vec<String>,

    /// Offer each event to every handler instead of stopping at the first.
    #[arg(long)]
    pub broadcast: bool,

    /// Exit after the first handled event.
    #[arg(long)]
    pub once: bool,

    /// Log filter when `RUST_LOG` is unset.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log JSON lines.
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    /// Overlay the flags that were given onto `settings`.
    pub fn apply(&self, settings: &mut TetherSettings) {
        if let Some(server) = &self.server {
            settings.session.server_url.clone_from(server);
        }
        if let Some(oauth) = &self.oauth {
            settings.session.oauth_url.clone_from(oauth);
        }
        if let Some(agent) = &self.agent {
            settings.session.agent_name.clone_from(agent);
        }
        if let Some(dir) = &self.token_dir {
            settings.session.token_dir = Some(dir.display().to_string());
        }
        if let Some(mode) = self.wait_mode {
            settings.wait.mode = mode;
        }
        if let Some(timeout) = self.timeout {
            settings.wait.timeout_secs = timeout;
        }
        if !self.handlers.is_empty() {
            settings.handlers.keys.clone_from(&self.handlers);
        }
        if self.broadcast {
            settings.handlers.chain = false;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json {
            settings.logging.json = true;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_settings() {
        let cli = Cli::try_parse_from([
            "tether",
            "--server",
            "https://chat.example.com/mcp",
            "--agent",
            "scout",
            "--wait-mode",
            "urgent",
            "--timeout",
            "300",
            "--handler",
            "ack",
            "--handler",
            "log",
            "--broadcast",
            "--once",
        ])
        .unwrap();

        let mut settings = TetherSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.session.server_url, "https://chat.example.com/mcp");
        assert_eq!(settings.session.agent_name, "scout");
        assert_eq!(settings.wait.mode, WaitMode::Urgent);
        assert_eq!(settings.wait.timeout_secs, 300);
        assert_eq!(settings.handlers.keys, vec!["ack", "log"]);
        assert!(!settings.handlers.chain);
        assert!(cli.once);
    }

    #[test]
    fn absent_flags_leave_settings_alone() {
        let cli = Cli::try_parse_from(["tether"]).unwrap();
        let mut settings = TetherSettings::default();
        settings.session.agent_name = "from-file".into();
        cli.apply(&mut settings);
        assert_eq!(settings.session.agent_name, "from-file");
        assert_eq!(settings.handlers.keys, vec!["log"]);
        assert!(settings.handlers.chain);
    }

    #[test]
    fn unknown_wait_mode_is_rejected() {
        assert!(Cli::try_parse_from(["tether", "--wait-mode", "everything"]).is_err());
    }
}
