//! The authenticated session: one credential, one refresh at a time.
//!
//! [`AuthSession::ensure_valid`] is called before every transport operation.
//! The credential sits behind a `tokio::sync::Mutex` that is held across the
//! refresh request, so concurrent callers (the supervisor and the proactive
//! refresh timer) wait for the in-flight refresh instead of starting another.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::AuthError;
use crate::oauth;
use crate::pkce::{generate_pkce, generate_state};
use crate::storage::TokenStore;
use crate::types::{Credential, FALLBACK_CLIENT_ID, OAuthConfig};

/// Token endpoint request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Timer pause after a failed proactive refresh or while no credential exists.
const TIMER_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// What the external authorization step is asked to do.
#[derive(Clone, Debug)]
pub struct AuthorizationRequest {
    /// URL the user should open.
    pub url: String,
    /// Opaque state echoed by the authorization server.
    pub state: String,
    /// Redirect URI the code is delivered to.
    pub redirect_uri: String,
}

/// Result of the external authorization step.
#[derive(Clone, Debug)]
pub enum AuthorizationGrant {
    /// An authorization code to exchange at the token endpoint.
    Code(String),
    /// Tokens obtained by some other means.
    Tokens(Credential),
}

/// External, blocking authorization step (browser consent, paste-a-code, ...).
///
/// Runs on its own detached thread; it may wait on user input. A caller that
/// stops waiting abandons the thread rather than joining it.
pub trait Authorizer: Send + Sync {
    /// Drive the user through consent and return the grant.
    fn authorize(&self, request: &AuthorizationRequest) -> Result<AuthorizationGrant, AuthError>;
}

#[derive(Default)]
struct CredentialSlot {
    credential: Option<Credential>,
    force_refresh: bool,
    /// Set when a refresh was rejected; cleared only by `reauthorize`.
    revoked: Option<String>,
}

/// Owns the credential for one agent identity and its refresh policy.
pub struct AuthSession {
    store: TokenStore,
    config: OAuthConfig,
    client: reqwest::Client,
    authorizer: Option<Arc<dyn Authorizer>>,
    slot: Mutex<CredentialSlot>,
}

impl AuthSession {
    /// Create a session over an explicit token store.
    pub fn new(store: TokenStore, config: OAuthConfig) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self::with_client(store, config, client))
    }

    /// Create a session with a caller-supplied HTTP client.
    #[must_use]
    pub fn with_client(store: TokenStore, config: OAuthConfig, client: reqwest::Client) -> Self {
        Self {
            store,
            config,
            client,
            authorizer: None,
            slot: Mutex::new(CredentialSlot::default()),
        }
    }

    /// Install the step used when no credential exists.
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// The token store.
    #[must_use]
    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Return a credential that is outside the refresh margin.
    ///
    /// Loads from the store on first use and falls back to the authorizer
    /// when nothing is stored. A credential within the margin (or already
    /// expired) is refreshed before it is returned.
    ///
    /// An unrecoverable refresh failure drops the credential, retires the
    /// stored files, and makes every later call fail with
    /// [`AuthError::Revoked`] until [`reauthorize`](Self::reauthorize) runs.
    /// This holds whether the failure was hit here or by the refresh timer.
    #[tracing::instrument(skip_all)]
    pub async fn ensure_valid(&self) -> Result<Credential, AuthError> {
        let mut slot = self.slot.lock().await;

        if let Some(reason) = &slot.revoked {
            return Err(AuthError::Revoked(reason.clone()));
        }
        if slot.credential.is_none() {
            slot.credential = self.store.load()?;
        }
        let Some(current) = slot.credential.clone() else {
            let credential = self.authorize().await?;
            return Ok(self.adopt(&mut slot, credential));
        };

        let due = slot.force_refresh || current.needs_refresh(self.config.refresh_margin, Utc::now());
        if !due {
            return Ok(current);
        }

        debug!(
            forced = slot.force_refresh,
            expires_at = %current.expires_at,
            "refreshing credential"
        );
        match self.refresh(&current).await {
            Ok(refreshed) => Ok(self.adopt(&mut slot, refreshed)),
            Err(e) if e.is_unrecoverable() => {
                warn!(error = %e, "refresh rejected, credential discarded");
                slot.credential = None;
                slot.force_refresh = false;
                slot.revoked = Some(e.to_string());
                if let Err(inv) = self.store.invalidate() {
                    warn!(error = %inv, "failed to retire stored credentials");
                }
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "refresh failed, will retry");
                Err(e)
            }
        }
    }

    /// Drop any credential or revocation and run the authorizer again.
    pub async fn reauthorize(&self) -> Result<Credential, AuthError> {
        let mut slot = self.slot.lock().await;
        slot.credential = None;
        slot.force_refresh = false;
        slot.revoked = None;
        info!("re-authorization requested");
        let credential = self.authorize().await?;
        Ok(self.adopt(&mut slot, credential))
    }

    /// Make `credential` current, then persist it.
    ///
    /// The in-memory copy is updated first: a rotated refresh token must not
    /// be lost to a failed write.
    fn adopt(&self, slot: &mut CredentialSlot, credential: Credential) -> Credential {
        slot.credential = Some(credential.clone());
        slot.force_refresh = false;
        if let Err(e) = self.store.save(&credential) {
            warn!(dir = %self.store.dir().display(), error = %e, "failed to persist credential");
        }
        credential
    }

    /// Mark the access token as rejected so the next
    /// [`ensure_valid`](Self::ensure_valid) refreshes regardless of expiry.
    pub async fn invalidate_access(&self) {
        let mut slot = self.slot.lock().await;
        slot.force_refresh = true;
        info!("access token rejected, refresh forced");
    }

    /// Current credential without any refresh or I/O.
    pub async fn current(&self) -> Option<Credential> {
        self.slot.lock().await.credential.clone()
    }

    /// Spawn a timer that refreshes ahead of expiry until `cancel` fires.
    ///
    /// The timer stops on an unrecoverable error. The session stays revoked,
    /// so the supervisor's next [`ensure_valid`](Self::ensure_valid) fails
    /// with [`AuthError::Revoked`].
    pub fn spawn_refresh_timer(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let pause = session.time_until_refresh().await;
                tokio::select! {
                    () = tokio::time::sleep(pause) => {}
                    () = cancel.cancelled() => return,
                }
                if session.current().await.is_none() {
                    continue;
                }
                match session.ensure_valid().await {
                    Ok(cred) => debug!(expires_at = %cred.expires_at, "proactive refresh check done"),
                    Err(e) if e.is_unrecoverable() => {
                        warn!(error = %e, "proactive refresh stopped");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "proactive refresh failed");
                        tokio::select! {
                            () = tokio::time::sleep(TIMER_RETRY_INTERVAL) => {}
                            () = cancel.cancelled() => return,
                        }
                    }
                }
            }
        })
    }

    async fn time_until_refresh(&self) -> Duration {
        let slot = self.slot.lock().await;
        match &slot.credential {
            Some(cred) => cred
                .remaining(Utc::now())
                .saturating_sub(self.config.refresh_margin),
            None => TIMER_RETRY_INTERVAL,
        }
    }

    fn client_id(&self) -> String {
        if !self.config.client_id.is_empty() {
            return self.config.client_id.clone();
        }
        self.store
            .client_id()
            .unwrap_or_else(|| FALLBACK_CLIENT_ID.to_string())
    }

    async fn refresh(&self, current: &Credential) -> Result<Credential, AuthError> {
        let refresh = current
            .refresh_token
            .as_deref()
            .ok_or(AuthError::MissingRefreshToken)?;
        let resp = oauth::refresh_token(&self.client, &self.config, &self.client_id(), refresh)
            .await?;
        let refreshed = Credential::from_response(resp, Utc::now(), current.refresh_token.clone());
        info!(expires_at = %refreshed.expires_at, "credential refreshed");
        Ok(refreshed)
    }

    async fn authorize(&self) -> Result<Credential, AuthError> {
        let Some(authorizer) = self.authorizer.clone() else {
            return Err(AuthError::NotAuthorized(format!(
                "no stored credential in {} and no authorizer configured",
                self.store.dir().display()
            )));
        };

        let client_id = self.client_id();
        let pkce = generate_pkce();
        let state = generate_state();
        let url = oauth::authorization_url(&self.config, &client_id, &pkce.challenge, &state)?;
        let request = AuthorizationRequest {
            url: url.to_string(),
            state,
            redirect_uri: self.config.redirect_uri.clone(),
        };

        info!("no stored credential, starting authorization");
        // A detached thread: a pending stdin read must not hold up runtime shutdown.
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _ = std::thread::Builder::new()
            .name("tether-authorize".into())
            .spawn(move || {
                let _ = tx.send(authorizer.authorize(&request));
            })?;
        let grant = rx.await.map_err(|_| {
            AuthError::NotAuthorized("authorization step ended without a result".into())
        })??;

        match grant {
            AuthorizationGrant::Tokens(credential) => Ok(credential),
            AuthorizationGrant::Code(code) => {
                let resp = oauth::exchange_code(
                    &self.client,
                    &self.config,
                    &client_id,
                    &code,
                    &pkce.verifier,
                    &self.config.redirect_uri,
                )
                .await?;
                Ok(Credential::from_response(resp, Utc::now(), None))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
