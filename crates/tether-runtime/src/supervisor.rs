//! The session control loop.
//!
//! [`ReconnectSupervisor`] owns the [`ConnectionState`] and is the only code
//! that changes it:
//!
//! ```text
//! Disconnected ─▶ Authenticating ─▶ Waiting ─▶ Processing ─┐
//!                    ▲    │            │  ▲                 │
//!                    │    ▼            ▼  └─────────────────┘
//!                    └── Backoff ◀─────┘
//!                          │
//!                          ▼
//!                        Failed          (any state) ─▶ Stopped
//! ```
//!
//! While `Waiting`, the wait call races the heartbeat watcher and the
//! shutdown token. A stall or a transport error goes to `Backoff`; an
//! undecodable response counts as an empty one. Every transition is logged
//! with its cause and kept in a bounded history.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tether_auth::{AuthError, AuthSession, Credential};
use tether_core::{
    Backoff, BackoffPolicy, BackoffStep, ConnectionState, ErrorKind, Event, EventId, ListMode,
    RunId, WaitMode, WaitRequest,
};
use tether_settings::TetherSettings;
use tether_transport::{HeartbeatMonitor, HeartbeatResult, TransportError, WaitError, WaitTransport};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::dedup::DedupTracker;
use crate::dispatch::HandlerDispatcher;

/// Transitions kept for diagnostics.
pub const HISTORY_CAPACITY: usize = 64;

/// Source of valid credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// A credential safe to present right now.
    async fn ensure_valid(&self) -> Result<Credential, AuthError>;

    /// The server rejected the current access token.
    async fn invalidate_access(&self);
}

#[async_trait]
impl CredentialProvider for AuthSession {
    async fn ensure_valid(&self) -> Result<Credential, AuthError> {
        AuthSession::ensure_valid(self).await
    }

    async fn invalidate_access(&self) {
        AuthSession::invalidate_access(self).await;
    }
}

/// Loop parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Wake condition for each wait call.
    pub wait_mode: WaitMode,
    /// Server-side wait timeout.
    pub wait_timeout: Duration,
    /// Events per response.
    pub limit: u32,
    /// Inbox slice.
    pub list_mode: ListMode,
    /// How often the heartbeat is checked while waiting.
    pub check_interval: Duration,
    /// Retry policy.
    pub backoff: BackoffPolicy,
    /// Stop after the first handled event.
    pub once: bool,
}

impl SupervisorConfig {
    /// Derive the loop parameters from resolved settings.
    #[must_use]
    pub fn from_settings(settings: &TetherSettings) -> Self {
        Self {
            wait_mode: settings.wait.mode,
            wait_timeout: settings.wait.timeout(),
            limit: settings.wait.limit,
            list_mode: settings.wait.list_mode,
            check_interval: settings.heartbeat.check_interval(),
            backoff: settings.backoff.clone(),
            once: false,
        }
    }

    /// Set once mode.
    #[must_use]
    pub fn with_once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from_settings(&TetherSettings::default())
    }
}

/// One recorded state change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    /// Prior state.
    pub from: ConnectionState,
    /// New state.
    pub to: ConnectionState,
    /// What triggered it.
    pub cause: String,
    /// When it happened.
    pub at: Instant,
}

/// How a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOutcome {
    /// `Failed` or `Stopped`.
    pub final_state: ConnectionState,
    /// Set when the session failed.
    pub error_kind: Option<ErrorKind>,
    /// Final fatal message, if any.
    pub message: Option<String>,
    /// Events handled during the session.
    pub handled: u64,
}

impl SessionOutcome {
    /// Whether the session ended without a fatal error.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.final_state == ConnectionState::Stopped
    }
}

/// Collaborators driven by the supervisor.
pub struct SupervisorParts {
    /// Credential source.
    pub auth: Arc<dyn CredentialProvider>,
    /// Wait call implementation.
    pub transport: Arc<dyn WaitTransport>,
    /// Heartbeat fed by `transport`.
    pub heartbeat: Arc<HeartbeatMonitor>,
    /// Processed-event record.
    pub dedup: DedupTracker,
    /// Handlers for new events.
    pub dispatcher: HandlerDispatcher,
}

enum WaitOutcome {
    Completed(Result<Vec<Event>, WaitError>),
    Stalled(Duration),
    Shutdown,
}

/// Drives one agent session through the connection state machine.
pub struct ReconnectSupervisor {
    run_id: RunId,
    auth: Arc<dyn CredentialProvider>,
    transport: Arc<dyn WaitTransport>,
    heartbeat: Arc<HeartbeatMonitor>,
    dedup: DedupTracker,
    dispatcher: HandlerDispatcher,
    config: SupervisorConfig,
    backoff: Backoff,
    shutdown: CancellationToken,
    state: ConnectionState,
    history: VecDeque<Transition>,
    credential: Option<Credential>,
    inbox: Vec<Event>,
    cursor: Option<EventId>,
    pace_next_wait: bool,
    handled: u64,
    failure: Option<(ErrorKind, String)>,
}

impl ReconnectSupervisor {
    /// Assemble a supervisor in `Disconnected`. Cancelling `shutdown` stops it.
    #[must_use]
    pub fn new(parts: SupervisorParts, config: SupervisorConfig, shutdown: CancellationToken) -> Self {
        let backoff = Backoff::new(config.backoff.clone());
        Self {
            run_id: RunId::new(),
            auth: parts.auth,
            transport: parts.transport,
            heartbeat: parts.heartbeat,
            dedup: parts.dedup,
            dispatcher: parts.dispatcher,
            config,
            backoff,
            shutdown,
            state: ConnectionState::Disconnected,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            credential: None,
            inbox: Vec::new(),
            cursor: None,
            pace_next_wait: false,
            handled: 0,
            failure: None,
        }
    }

    /// Identifier attached to this supervisor's tracing span.
    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Most recent transitions, oldest first.
    #[must_use]
    pub fn history(&self) -> &VecDeque<Transition> {
        &self.history
    }

    /// Id of the newest event of the last response.
    #[must_use]
    pub fn cursor(&self) -> Option<&EventId> {
        self.cursor.as_ref()
    }

    /// Processed-event record.
    #[must_use]
    pub fn dedup(&self) -> &DedupTracker {
        &self.dedup
    }

    /// Token that stops the session when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until `Failed` or `Stopped`.
    #[instrument(skip_all, fields(
        agent = %self.dispatcher.context().identity.agent_name,
        run_id = %self.run_id,
    ))]
    pub async fn run(&mut self) -> SessionOutcome {
        match self.dedup.prune() {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "pruned dedup store at startup"),
            Err(e) => {
                self.fail(ErrorKind::Storage, format!("dedup store unusable: {e}"));
                return self.outcome();
            }
        }

        self.transition(ConnectionState::Authenticating, "session start");
        loop {
            match self.state {
                ConnectionState::Authenticating => self.authenticate().await,
                ConnectionState::Waiting => self.wait_for_events().await,
                ConnectionState::Processing => self.process_events().await,
                ConnectionState::Backoff => self.back_off().await,
                ConnectionState::Disconnected
                | ConnectionState::Failed
                | ConnectionState::Stopped => break,
            }
        }

        let outcome = self.outcome();
        info!(
            final_state = %outcome.final_state,
            handled = outcome.handled,
            error_kind = outcome.error_kind.map_or("-", ErrorKind::as_str),
            "session ended"
        );
        outcome
    }

    async fn authenticate(&mut self) {
        let auth = Arc::clone(&self.auth);
        let shutdown = self.shutdown.clone();
        let result = tokio::select! {
            biased;
            () = shutdown.cancelled() => None,
            r = auth.ensure_valid() => Some(r),
        };

        match result {
            None => self.stop("shutdown while authenticating"),
            Some(Ok(credential)) => {
                self.credential = Some(credential);
                self.transition(ConnectionState::Waiting, "credential valid");
            }
            Some(Err(e)) if e.is_unrecoverable() => {
                self.credential = None;
                self.fail(ErrorKind::AuthUnrecoverable, format!("authorization failed: {e}"));
            }
            Some(Err(e)) => {
                self.transition(ConnectionState::Backoff, format!("auth error: {e}"));
            }
        }
    }

    async fn wait_for_events(&mut self) {
        let Some(credential) = self.credential.clone() else {
            self.transition(ConnectionState::Backoff, "no credential");
            return;
        };
        let shutdown = self.shutdown.clone();

        if std::mem::take(&mut self.pace_next_wait) {
            let pause = Duration::from_millis(self.config.backoff.min_delay_ms);
            let interrupted = tokio::select! {
                biased;
                () = shutdown.cancelled() => true,
                () = tokio::time::sleep(pause) => false,
            };
            if interrupted {
                self.stop("shutdown while waiting");
                return;
            }
        }

        let request = WaitRequest::new(self.config.wait_mode, self.config.wait_timeout)
            .with_since(self.cursor.clone())
            .with_limit(self.config.limit)
            .with_list_mode(self.config.list_mode);
        let transport = Arc::clone(&self.transport);
        let heartbeat = Arc::clone(&self.heartbeat);
        let check_interval = self.config.check_interval;

        heartbeat.tick();
        let outcome = tokio::select! {
            biased;
            () = shutdown.cancelled() => WaitOutcome::Shutdown,
            watched = heartbeat.watch(check_interval, shutdown.child_token()) => match watched {
                HeartbeatResult::Stalled { silent_for } => WaitOutcome::Stalled(silent_for),
                HeartbeatResult::Cancelled => WaitOutcome::Shutdown,
            },
            result = transport.wait(&request, &credential) => WaitOutcome::Completed(result),
        };

        match outcome {
            WaitOutcome::Shutdown => self.stop("shutdown while waiting"),
            WaitOutcome::Stalled(silent_for) => {
                warn!(silent_s = silent_for.as_secs(), "wait call stalled, abandoning it");
                transport.reset().await;
                self.transition(
                    ConnectionState::Backoff,
                    format!("stall: no heartbeat for {}s", silent_for.as_secs()),
                );
            }
            WaitOutcome::Completed(Ok(events)) => {
                self.backoff.reset();
                let cause = format!("{} events received", events.len());
                self.inbox = events;
                self.transition(ConnectionState::Processing, cause);
            }
            WaitOutcome::Completed(Err(WaitError::Protocol(e))) => {
                warn!(error = %e, "undecodable wait response, treating as empty");
                self.inbox.clear();
                self.pace_next_wait = true;
                self.transition(ConnectionState::Processing, format!("protocol error: {e}"));
            }
            WaitOutcome::Completed(Err(WaitError::Transport(e))) => {
                if matches!(e, TransportError::Unauthorized) {
                    self.credential = None;
                    self.auth.invalidate_access().await;
                }
                self.transition(ConnectionState::Backoff, format!("transport error: {e}"));
            }
        }
    }

    /// Dispatch the inbox in order.
    ///
    /// The cursor advances only across the leading run of events that are
    /// handled or already recorded. The first event that fails or finds no
    /// taker pins it, so a server honouring `since` reports that event again.
    async fn process_events(&mut self) {
        let events = std::mem::take(&mut self.inbox);

        let (mut handled, mut duplicates, mut failed) = (0usize, 0usize, 0usize);
        let mut settled = true;
        for event in &events {
            if !self.dedup.is_new(event) {
                duplicates += 1;
                debug!(event_id = %event.id, "skipping processed event");
                if settled {
                    self.cursor = Some(event.id.clone());
                }
                continue;
            }

            let shutdown = self.shutdown.clone();
            let result = tokio::select! {
                biased;
                () = shutdown.cancelled() => None,
                r = self.dispatcher.dispatch(event) => Some(r),
            };

            match result {
                None => {
                    self.stop("shutdown while processing");
                    return;
                }
                Some(Ok(true)) => {
                    if let Err(e) = self.dedup.mark_processed(event) {
                        self.fail(
                            ErrorKind::Storage,
                            format!("failed to record event {}: {e}", event.id),
                        );
                        return;
                    }
                    handled += 1;
                    self.handled += 1;
                    if settled {
                        self.cursor = Some(event.id.clone());
                    }
                    if self.config.once {
                        self.stop(format!("once mode: handled {}", event.id));
                        return;
                    }
                }
                Some(Ok(false)) => {
                    debug!(event_id = %event.id, "no handler accepted event");
                    settled = false;
                }
                Some(Err(_)) => {
                    failed += 1;
                    settled = false;
                }
            }
        }

        if !settled {
            // the same events come straight back; don't spin on them
            self.pace_next_wait = true;
            debug!(cursor = ?self.cursor, "cursor held for redelivery");
        }

        self.transition(
            ConnectionState::Waiting,
            format!(
                "processed {} events: {handled} handled, {duplicates} duplicate, {failed} failed",
                events.len()
            ),
        );
    }

    async fn back_off(&mut self) {
        let delay = match self.backoff.record_failure() {
            BackoffStep::Delay(delay) => delay,
            BackoffStep::Exhausted { failures } => {
                self.fail(
                    ErrorKind::BackoffExhausted,
                    format!("giving up after {failures} consecutive failures"),
                );
                return;
            }
        };

        info!(
            delay_ms = delay.as_millis(),
            failures = self.backoff.consecutive_failures(),
            "backing off"
        );
        let shutdown = self.shutdown.clone();
        let interrupted = tokio::select! {
            biased;
            () = shutdown.cancelled() => true,
            () = tokio::time::sleep(delay) => false,
        };

        if interrupted {
            self.stop("shutdown during backoff");
        } else {
            self.transition(
                ConnectionState::Authenticating,
                format!("retry after {}ms", delay.as_millis()),
            );
        }
    }

    fn stop(&mut self, cause: impl Into<String>) {
        self.transition(ConnectionState::Stopped, cause);
    }

    fn fail(&mut self, kind: ErrorKind, message: String) {
        error!(error_kind = %kind, message = %message, "session failed");
        self.failure = Some((kind, message.clone()));
        self.transition(ConnectionState::Failed, message);
    }

    fn transition(&mut self, next: ConnectionState, cause: impl Into<String>) {
        let cause = cause.into();
        let from = self.state;
        debug_assert!(
            from.can_transition_to(next),
            "illegal transition {from} -> {next} ({cause})"
        );
        info!(from = %from, to = %next, cause = %cause, "state transition");

        if self.history.len() == HISTORY_CAPACITY {
            let _ = self.history.pop_front();
        }
        self.history.push_back(Transition {
            from,
            to: next,
            cause,
            at: Instant::now(),
        });
        self.state = next;
    }

    fn outcome(&self) -> SessionOutcome {
        SessionOutcome {
            final_state: self.state,
            error_kind: self.failure.as_ref().map(|(kind, _)| *kind),
            message: self.failure.as_ref().map(|(_, msg)| msg.clone()),
            handled: self.handled,
        }
    }
}

impl std::fmt::Debug for ReconnectSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectSupervisor")
            .field("run_id", &self.run_id)
            .field("state", &self.state)
            .field("cursor", &self.cursor)
            .field("failures", &self.backoff.consecutive_failures())
            .field("handled", &self.handled)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use chrono::Utc;
    use tether_core::AgentIdentity;
    use tether_transport::ProtocolError;

    use crate::dedup::RetentionPolicy;
    use crate::dispatch::{DispatchMode, EventHandler, HandlerContext};
    use crate::errors::HandlerError;

    use tether_core::ConnectionState::{
        Authenticating, Backoff as BackoffState, Failed, Processing, Stopped, Waiting,
    };

    fn credential() -> Credential {
        Credential {
            access_token: "tok".into(),
            refresh_token: Some("ref".into()),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            scope: None,
        }
    }

    #[derive(Default)]
    struct FakeAuth {
        script: Mutex<VecDeque<Result<Credential, AuthError>>>,
        calls: AtomicUsize,
        invalidations: AtomicUsize,
    }

    impl FakeAuth {
        fn scripted(results: Vec<Result<Credential, AuthError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(results.into()),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl CredentialProvider for FakeAuth {
        async fn ensure_valid(&self) -> Result<Credential, AuthError> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(credential()))
        }

        async fn invalidate_access(&self) {
            let _ = self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Clone)]
    enum Reply {
        Events(Vec<&'static str>),
        /// Server-side log: returns the entries after `since`.
        Log(Vec<&'static str>),
        Fail,
        Unauthorized,
        Garbage,
        Hang,
    }

    /// Plays back `script`; once it runs dry, cancels `done` and hangs.
    struct FakeTransport {
        script: Mutex<VecDeque<Reply>>,
        requests: Mutex<Vec<WaitRequest>>,
        resets: AtomicUsize,
        done: CancellationToken,
    }

    impl FakeTransport {
        fn new(script: Vec<Reply>, done: &CancellationToken) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
                resets: AtomicUsize::new(0),
                done: done.clone(),
            })
        }

        fn cursors(&self) -> Vec<Option<String>> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.since.as_ref().map(|id| id.as_str().to_string()))
                .collect()
        }
    }

    #[async_trait]
    impl WaitTransport for FakeTransport {
        async fn wait(
            &self,
            request: &WaitRequest,
            _credential: &Credential,
        ) -> Result<Vec<Event>, WaitError> {
            self.requests.lock().unwrap().push(request.clone());
            let reply = self.script.lock().unwrap().pop_front();
            match reply {
                Some(Reply::Events(ids)) => Ok(ids
                    .into_iter()
                    .map(|id| Event::new(id, format!("body {id}")))
                    .collect()),
                Some(Reply::Log(ids)) => {
                    let start = request
                        .since
                        .as_ref()
                        .and_then(|since| ids.iter().position(|id| *id == since.as_str()))
                        .map_or(0, |i| i + 1);
                    Ok(ids[start..]
                        .iter()
                        .map(|id| Event::new(*id, format!("body {id}")))
                        .collect())
                }
                Some(Reply::Fail) => Err(TransportError::Http {
                    status: 502,
                    message: "bad gateway".into(),
                }
                .into()),
                Some(Reply::Unauthorized) => Err(TransportError::Unauthorized.into()),
                Some(Reply::Garbage) => {
                    Err(ProtocolError::UnknownShape("object with keys [weird]".into()).into())
                }
                Some(Reply::Hang) => std::future::pending().await,
                None => {
                    self.done.cancel();
                    std::future::pending().await
                }
            }
        }

        async fn reset(&self) {
            let _ = self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Counts calls per event id; ids in `fail_once` fail on their first call,
    /// ids in `decline` are never accepted.
    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<HashMap<String, usize>>,
        fail_once: Mutex<HashSet<String>>,
        decline: Mutex<HashSet<String>>,
    }

    impl RecordingHandler {
        fn calls(&self, id: &str) -> usize {
            self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        fn name(&self) -> &str {
            "recording"
        }

        async fn handle(&self, event: &Event, _c: &HandlerContext) -> Result<bool, HandlerError> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(event.id.as_str().to_string())
                .or_default() += 1;
            if self.fail_once.lock().unwrap().remove(event.id.as_str()) {
                return Err(HandlerError::new("recording", "flaky"));
            }
            Ok(!self.decline.lock().unwrap().contains(event.id.as_str()))
        }
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            wait_mode: WaitMode::Mentions,
            wait_timeout: Duration::from_secs(120),
            limit: 10,
            list_mode: ListMode::Unread,
            check_interval: Duration::from_secs(5),
            backoff: BackoffPolicy {
                min_delay_ms: 2_000,
                max_delay_ms: 30_000,
                max_consecutive_failures: 10,
            },
            once: false,
        }
    }

    fn build(
        auth: Arc<FakeAuth>,
        transport: Arc<FakeTransport>,
        handler: Arc<RecordingHandler>,
        dedup: DedupTracker,
        config: SupervisorConfig,
        shutdown: CancellationToken,
    ) -> ReconnectSupervisor {
        let context = HandlerContext {
            identity: AgentIdentity::new("scout"),
            server_url: "https://example.test/mcp".into(),
        };
        let handler: Arc<dyn EventHandler> = handler;
        ReconnectSupervisor::new(
            SupervisorParts {
                auth,
                transport,
                heartbeat: Arc::new(HeartbeatMonitor::new(Duration::from_secs(180))),
                dedup,
                dispatcher: HandlerDispatcher::new(vec![handler], DispatchMode::Chain, context),
            },
            config,
            shutdown,
        )
    }

    struct Run {
        supervisor: ReconnectSupervisor,
        outcome: SessionOutcome,
        auth: Arc<FakeAuth>,
        transport: Arc<FakeTransport>,
        handler: Arc<RecordingHandler>,
    }

    async fn run_script(auth: Vec<Result<Credential, AuthError>>, replies: Vec<Reply>, config: SupervisorConfig) -> Run {
        run_with(auth, replies, config, Arc::default(), memory_dedup()).await
    }

    async fn run_with(
        auth: Vec<Result<Credential, AuthError>>,
        replies: Vec<Reply>,
        config: SupervisorConfig,
        handler: Arc<RecordingHandler>,
        dedup: DedupTracker,
    ) -> Run {
        let shutdown = CancellationToken::new();
        let auth = FakeAuth::scripted(auth);
        let transport = FakeTransport::new(replies, &shutdown);
        let mut supervisor = build(
            Arc::clone(&auth),
            Arc::clone(&transport),
            Arc::clone(&handler),
            dedup,
            config,
            shutdown,
        );
        let outcome = supervisor.run().await;
        Run {
            supervisor,
            outcome,
            auth,
            transport,
            handler,
        }
    }

    fn memory_dedup() -> DedupTracker {
        DedupTracker::in_memory(RetentionPolicy::default()).unwrap()
    }

    fn path(supervisor: &ReconnectSupervisor) -> Vec<(ConnectionState, ConnectionState)> {
        supervisor.history().iter().map(|t| (t.from, t.to)).collect()
    }

    /// Time spent in each `Backoff` that ended in a retry.
    fn backoff_delays(supervisor: &ReconnectSupervisor) -> Vec<Duration> {
        let history: Vec<&Transition> = supervisor.history().iter().collect();
        history
            .windows(2)
            .filter(|w| w[0].to == BackoffState && w[1].to == Authenticating)
            .map(|w| w[1].at - w[0].at)
            .collect()
    }

    fn assert_delays(actual: &[Duration], expected_secs: &[u64]) {
        assert_eq!(actual.len(), expected_secs.len(), "delays: {actual:?}");
        for (got, want) in actual.iter().zip(expected_secs) {
            let want = Duration::from_secs(*want);
            assert!(
                *got >= want && *got <= want + Duration::from_millis(5),
                "expected ~{want:?}, got {got:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_then_resets_after_success() {
        let run = run_script(
            vec![],
            vec![
                Reply::Fail,
                Reply::Fail,
                Reply::Fail,
                Reply::Events(vec!["a"]),
                Reply::Fail,
            ],
            config(),
        )
        .await;

        assert_eq!(run.outcome.final_state, Stopped);
        assert_delays(&backoff_delays(&run.supervisor), &[2, 4, 8, 2]);
        assert_eq!(run.handler.calls("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_capped_at_maximum() {
        let mut cfg = config();
        cfg.backoff.max_delay_ms = 5_000;
        let run = run_script(vec![], vec![Reply::Fail, Reply::Fail, Reply::Fail, Reply::Fail], cfg).await;
        assert_delays(&backoff_delays(&run.supervisor), &[2, 4, 5, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_event_is_dispatched_once() {
        let run = run_script(
            vec![],
            vec![Reply::Events(vec!["a", "b"]), Reply::Events(vec!["b", "c"])],
            config(),
        )
        .await;

        assert_eq!(run.handler.calls("a"), 1);
        assert_eq!(run.handler.calls("b"), 1);
        assert_eq!(run.handler.calls("c"), 1);
        assert_eq!(run.outcome.handled, 3);
        assert_eq!(
            run.transport.cursors(),
            vec![None, Some("b".to_string()), Some("c".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn handler_error_leaves_event_for_redelivery() {
        let handler = Arc::new(RecordingHandler::default());
        let _ = handler.fail_once.lock().unwrap().insert("a".to_string());

        let run = run_with(
            vec![],
            vec![
                Reply::Events(vec!["a"]),
                Reply::Events(vec!["a"]),
                Reply::Events(vec!["a"]),
            ],
            config(),
            handler,
            memory_dedup(),
        )
        .await;

        assert_eq!(run.handler.calls("a"), 2);
        assert!(run.supervisor.dedup().contains("a"));
        assert!(!path(&run.supervisor).contains(&(Waiting, BackoffState)));
    }

    #[tokio::test(start_paused = true)]
    async fn cursor_holds_at_failed_event_until_handled() {
        let handler = Arc::new(RecordingHandler::default());
        let _ = handler.fail_once.lock().unwrap().insert("a".to_string());
        let log = || Reply::Log(vec!["a", "b"]);

        let run = run_with(vec![], vec![log(), log(), log()], config(), handler, memory_dedup()).await;

        assert_eq!(run.handler.calls("a"), 2);
        assert_eq!(run.handler.calls("b"), 1);
        assert!(run.supervisor.dedup().contains("a"));
        assert_eq!(
            run.transport.cursors(),
            vec![None, None, Some("b".to_string()), Some("b".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn declined_event_pins_cursor() {
        let handler = Arc::new(RecordingHandler::default());
        let _ = handler.decline.lock().unwrap().insert("b".to_string());
        let log = || Reply::Log(vec!["a", "b", "c"]);

        let run = run_with(vec![], vec![log(), log()], config(), handler, memory_dedup()).await;

        assert_eq!(run.handler.calls("a"), 1);
        assert_eq!(run.handler.calls("b"), 2);
        assert_eq!(run.handler.calls("c"), 1);
        assert!(!run.supervisor.dedup().contains("b"));
        assert_eq!(run.supervisor.cursor().map(EventId::as_str), Some("a"));
        assert_eq!(
            run.transport.cursors(),
            vec![None, Some("a".to_string()), Some("a".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unrecoverable_refresh_fails_regardless_of_backoff() {
        let run = run_script(
            vec![
                Ok(credential()),
                Err(AuthError::OAuth {
                    status: 400,
                    message: "invalid_grant".into(),
                }),
            ],
            vec![Reply::Fail],
            config(),
        )
        .await;

        assert_eq!(run.outcome.final_state, Failed);
        assert_eq!(run.outcome.error_kind, Some(ErrorKind::AuthUnrecoverable));
        assert_eq!(
            path(&run.supervisor),
            vec![
                (ConnectionState::Disconnected, Authenticating),
                (Authenticating, Waiting),
                (Waiting, BackoffState),
                (BackoffState, Authenticating),
                (Authenticating, Failed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_auth_error_backs_off() {
        let run = run_script(
            vec![Err(AuthError::OAuth {
                status: 503,
                message: "unavailable".into(),
            })],
            vec![Reply::Events(vec!["a"])],
            config(),
        )
        .await;

        assert!(run.outcome.is_clean());
        assert_eq!(run.auth.calls.load(Ordering::SeqCst), 2);
        assert!(path(&run.supervisor).contains(&(Authenticating, BackoffState)));
        assert_eq!(run.handler.calls("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stall_forces_backoff_within_one_check() {
        let mut cfg = config();
        cfg.backoff.max_consecutive_failures = 1;
        let run = run_script(vec![], vec![Reply::Hang, Reply::Hang], cfg).await;

        assert_eq!(run.outcome.final_state, Failed);
        assert_eq!(run.outcome.error_kind, Some(ErrorKind::BackoffExhausted));
        assert_eq!(run.transport.resets.load(Ordering::SeqCst), 2);

        let history: Vec<&Transition> = run.supervisor.history().iter().collect();
        let stall = history
            .windows(2)
            .find(|w| w[0].to == Waiting && w[1].to == BackoffState)
            .unwrap();
        assert!(stall[1].cause.starts_with("stall"));
        let waited = stall[1].at - stall[0].at;
        assert!(waited > Duration::from_secs(180), "{waited:?}");
        assert!(waited <= Duration::from_secs(185), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_backoff_fails_session() {
        let mut cfg = config();
        cfg.backoff.max_consecutive_failures = 3;
        let run = run_script(vec![], vec![Reply::Fail; 4], cfg).await;

        assert_eq!(run.outcome.final_state, Failed);
        assert_eq!(run.outcome.error_kind, Some(ErrorKind::BackoffExhausted));
        assert_matches!(run.outcome.message.as_deref(), Some(m) if m.contains("4 consecutive"));
        assert_delays(&backoff_delays(&run.supervisor), &[2, 4, 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_wait_stops_promptly() {
        let shutdown = CancellationToken::new();
        let transport = FakeTransport::new(vec![Reply::Hang], &shutdown);
        let mut supervisor = build(
            FakeAuth::scripted(vec![]),
            transport,
            Arc::default(),
            memory_dedup(),
            config(),
            shutdown.clone(),
        );

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            shutdown.cancel();
        });
        let started = Instant::now();
        let outcome = supervisor.run().await;
        trigger.await.unwrap();

        assert_eq!(outcome.final_state, Stopped);
        assert_eq!(outcome.error_kind, None);
        assert!(started.elapsed() <= Duration::from_secs(31));
        assert_eq!(supervisor.history().back().unwrap().from, Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_before_start_stops_immediately() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let mut supervisor = build(
            FakeAuth::scripted(vec![]),
            FakeTransport::new(vec![], &shutdown),
            Arc::default(),
            memory_dedup(),
            config(),
            shutdown,
        );
        let outcome = supervisor.run().await;
        assert_eq!(outcome.final_state, Stopped);
        assert_eq!(supervisor.history().back().unwrap().from, Authenticating);
    }

    #[tokio::test(start_paused = true)]
    async fn once_mode_stops_after_first_handled_event() {
        let run = run_script(vec![], vec![Reply::Events(vec!["a", "b"])], config().with_once(true)).await;

        assert_eq!(run.outcome.final_state, Stopped);
        assert_eq!(run.outcome.handled, 1);
        assert_eq!(run.handler.calls("a"), 1);
        assert_eq!(run.handler.calls("b"), 0);
        assert_eq!(run.supervisor.history().back().unwrap().from, Processing);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_invalidates_access_and_backs_off() {
        let run = run_script(vec![], vec![Reply::Unauthorized], config()).await;

        assert_eq!(run.auth.invalidations.load(Ordering::SeqCst), 1);
        assert_eq!(run.auth.calls.load(Ordering::SeqCst), 2);
        assert!(path(&run.supervisor).contains(&(Waiting, BackoffState)));
    }

    #[tokio::test(start_paused = true)]
    async fn protocol_error_counts_as_empty_response() {
        let run = run_script(vec![], vec![Reply::Garbage, Reply::Events(vec!["a"])], config()).await;

        assert!(run.outcome.is_clean());
        assert_eq!(run.handler.calls("a"), 1);
        let p = path(&run.supervisor);
        assert!(!p.contains(&(Waiting, BackoffState)));
        assert!(run.supervisor.history().iter().any(|t| t.cause.starts_with("protocol error")));
    }

    #[tokio::test(start_paused = true)]
    async fn processed_events_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("scout.db");

        let first = run_with(
            vec![],
            vec![Reply::Events(vec!["a"])],
            config(),
            Arc::default(),
            DedupTracker::open(&db, RetentionPolicy::default()).unwrap(),
        )
        .await;
        assert_eq!(first.handler.calls("a"), 1);
        drop(first);

        let second = run_with(
            vec![],
            vec![Reply::Events(vec!["a", "b"])],
            config(),
            Arc::default(),
            DedupTracker::open(&db, RetentionPolicy::default()).unwrap(),
        )
        .await;
        assert_eq!(second.handler.calls("a"), 0);
        assert_eq!(second.handler.calls("b"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_bounded() {
        let replies = (0..100).map(|_| Reply::Events(vec![])).collect();
        let run = run_script(vec![], replies, config()).await;

        let history = run.supervisor.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history.back().unwrap().to, Stopped);
    }

    #[test]
    fn config_follows_settings() {
        let mut settings = TetherSettings::default();
        settings.wait.mode = WaitMode::Direct;
        settings.wait.timeout_secs = 300;
        settings.heartbeat.check_interval_secs = 2;
        let cfg = SupervisorConfig::from_settings(&settings);
        assert_eq!(cfg.wait_mode, WaitMode::Direct);
        assert_eq!(cfg.wait_timeout, Duration::from_secs(300));
        assert_eq!(cfg.check_interval, Duration::from_secs(2));
        assert!(!cfg.once);
    }
}
