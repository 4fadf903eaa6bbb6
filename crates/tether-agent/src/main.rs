//! # tether
//!
//! Binary that wires one agent session together: settings, credentials,
//! transport, dedup store, handlers, and the reconnect supervisor. Exits 0
//! on a clean stop and 1 when the session fails.

#![deny(unsafe_code)]

mod cli;
mod paste;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tether_auth::{AuthSession, OAuthConfig, TokenStore};
use tether_core::{AgentIdentity, IdentityManager};
use tether_runtime::{
    CredentialProvider, DedupTracker, DispatchMode, HandlerContext, HandlerDispatcher, HandlerRegistry,
    ReconnectSupervisor, RetentionPolicy, ShutdownCoordinator, SupervisorConfig, SupervisorParts,
};
use tether_settings::{TetherSettings, load_settings_from_path, settings_path, tether_home, validate};
use tether_transport::{HeartbeatMonitor, McpTransport};
use tracing::{error, info, warn};

use crate::cli::Cli;
use crate::paste::PasteAuthorizer;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let path = cli.settings.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    validate(&settings).context("Invalid settings")?;

    tether_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let coordinator = ShutdownCoordinator::new();
    let (mut supervisor, auth) = build_session(&settings, &tether_home(), cli.once, &coordinator)?;

    let mut background = Vec::new();
    if settings.auth.proactive_refresh {
        background.push(auth.spawn_refresh_timer(coordinator.token()));
    }
    {
        let coordinator = coordinator.clone();
        background.push(tokio::spawn(async move {
            let token = coordinator.token();
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!(error = %e, "failed to listen for ctrl-c");
                        return;
                    }
                    coordinator.shutdown();
                }
                () = token.cancelled() => {}
            }
        }));
    }

    let outcome = supervisor.run().await;
    coordinator.drain(background, None).await;

    if outcome.is_clean() {
        info!(handled = outcome.handled, "tether stopped");
        return Ok(ExitCode::SUCCESS);
    }
    let kind = outcome
        .error_kind
        .map_or_else(|| "unknown".to_string(), |k| k.to_string());
    let message = outcome.message.unwrap_or_default();
    error!(error_kind = %kind, "tether failed: {message}");
    eprintln!("tether: session failed ({kind}): {message}");
    Ok(ExitCode::FAILURE)
}

/// Build the supervisor and its credential session from validated settings.
fn build_session(
    settings: &TetherSettings,
    home: &Path,
    once: bool,
    coordinator: &ShutdownCoordinator,
) -> Result<(ReconnectSupervisor, Arc<AuthSession>)> {
    let session = &settings.session;
    let identity = AgentIdentity::new(session.agent_name.clone());
    info!(
        agent = %identity.agent_name,
        client_instance = %identity.client_instance_id,
        server = %session.server_url,
        "starting session"
    );

    let store = TokenStore::new(session.resolved_token_dir(home));
    let mut oauth = OAuthConfig::from_base_url(&session.resolved_oauth_url())
        .with_refresh_margin(settings.auth.refresh_margin())
        .with_client_id(settings.auth.client_id.clone());
    oauth.redirect_uri.clone_from(&settings.auth.redirect_uri);
    oauth.scopes.clone_from(&settings.auth.scopes);
    let auth = Arc::new(
        AuthSession::new(store, oauth)
            .context("Failed to create auth session")?
            .with_authorizer(Arc::new(PasteAuthorizer)),
    );

    let heartbeat = Arc::new(HeartbeatMonitor::new(settings.heartbeat.stall_threshold()));
    let transport = McpTransport::new(
        session.server_url.clone(),
        IdentityManager::new(identity.clone()),
        Arc::clone(&heartbeat),
    )
    .context("Failed to create transport")?;

    let db = session.resolved_dedup_db(home);
    let dedup = DedupTracker::open(&db, RetentionPolicy::from(&settings.dedup))
        .with_context(|| format!("Failed to open dedup store: {}", db.display()))?;

    let handlers = HandlerRegistry::with_builtins()
        .resolve(settings.handlers.keys.as_slice())
        .context("Invalid handler selection")?;
    let dispatcher = HandlerDispatcher::new(
        handlers,
        DispatchMode::from_chain_flag(settings.handlers.chain),
        HandlerContext {
            identity,
            server_url: session.server_url.clone(),
        },
    );

    let credentials: Arc<dyn CredentialProvider> = auth.clone();
    let supervisor = ReconnectSupervisor::new(
        SupervisorParts {
            auth: credentials,
            transport: Arc::new(transport),
            heartbeat,
            dedup,
            dispatcher,
        },
        SupervisorConfig::from_settings(settings).with_once(once),
        coordinator.token(),
    );
    Ok((supervisor, auth))
}
