//! Event handlers and their dispatch.
//!
//! Handlers are selected by key from a [`HandlerRegistry`] of factories when
//! the session starts; an unknown key fails startup rather than the first
//! event. The [`HandlerDispatcher`] runs the selected handlers in order for
//! each new event and reports whether any of them handled it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tether_core::{AgentIdentity, Event};
use tracing::{debug, info, warn};

use crate::errors::{HandlerError, RegistryError};

/// What a handler knows about the session it serves.
#[derive(Clone, Debug)]
pub struct HandlerContext {
    /// Identity the session acts as.
    pub identity: AgentIdentity,
    /// Resolved message service endpoint.
    pub server_url: String,
}

/// Reacts to one event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handle `event`. `Ok(true)` marks it handled; an error leaves it unprocessed.
    async fn handle(&self, event: &Event, context: &HandlerContext) -> Result<bool, HandlerError>;
}

/// Builds a handler instance.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn EventHandler> + Send + Sync>;

/// Handler factories keyed by name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: BTreeMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in `log` and `ack` handlers.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("log", || -> Arc<dyn EventHandler> { Arc::new(LogHandler) });
        registry.register("ack", || -> Arc<dyn EventHandler> { Arc::new(AckHandler) });
        registry
    }

    /// Register `factory` under `key`, replacing any previous entry.
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn EventHandler> + Send + Sync + 'static,
    {
        let key = key.into();
        debug!(key = %key, "registering handler factory");
        let _ = self.factories.insert(key, Arc::new(factory));
    }

    /// Whether `key` is registered.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Registered keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Instantiate the handlers for `keys`, in order.
    pub fn resolve<S: AsRef<str>>(&self, keys: &[S]) -> Result<Vec<Arc<dyn EventHandler>>, RegistryError> {
        if keys.is_empty() {
            return Err(RegistryError::Empty);
        }
        keys.iter()
            .map(|key| {
                let key = key.as_ref();
                self.factories
                    .get(key)
                    .map(|factory| factory())
                    .ok_or_else(|| RegistryError::UnknownHandler {
                        key: key.to_string(),
                        available: self.keys().join(", "),
                    })
            })
            .collect()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

/// How multiple handlers share an event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// Stop at the first handler reporting `handled`.
    #[default]
    Chain,
    /// Every handler sees the event.
    Broadcast,
}

impl DispatchMode {
    /// `Chain` when `chain` is set, otherwise `Broadcast`.
    #[must_use]
    pub fn from_chain_flag(chain: bool) -> Self {
        if chain { Self::Chain } else { Self::Broadcast }
    }
}

/// Runs the selected handlers for each event.
pub struct HandlerDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
    mode: DispatchMode,
    context: HandlerContext,
}

impl HandlerDispatcher {
    /// Dispatcher over `handlers`, tried in order.
    #[must_use]
    pub fn new(handlers: Vec<Arc<dyn EventHandler>>, mode: DispatchMode, context: HandlerContext) -> Self {
        Self {
            handlers,
            mode,
            context,
        }
    }

    /// Context passed to every handler.
    #[must_use]
    pub fn context(&self) -> &HandlerContext {
        &self.context
    }

    /// Number of handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Offer `event` to the handlers. Each handler runs at most once.
    ///
    /// The first error aborts dispatch and is returned; the caller must not
    /// record the event as processed.
    pub async fn dispatch(&self, event: &Event) -> Result<bool, HandlerError> {
        let mut handled = false;
        for handler in &self.handlers {
            let outcome = handler.handle(event, &self.context).await;
            match outcome {
                Ok(true) => {
                    debug!(event_id = %event.id, handler = handler.name(), "event handled");
                    handled = true;
                    if self.mode == DispatchMode::Chain {
                        break;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(event_id = %event.id, handler = handler.name(), error = %e, "handler failed");
                    return Err(e);
                }
            }
        }
        Ok(handled)
    }
}

impl fmt::Debug for HandlerDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.handlers.iter().map(|h| h.name()).collect();
        f.debug_struct("HandlerDispatcher")
            .field("handlers", &names)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Logs each event at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHandler;

#[async_trait]
impl EventHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, event: &Event, context: &HandlerContext) -> Result<bool, HandlerError> {
        info!(
            agent = %context.identity.agent_name,
            event_id = %event.id,
            sender = event.sender.as_deref().unwrap_or("-"),
            space = event.space.as_deref().unwrap_or("-"),
            body = %event.body,
            "event received"
        );
        Ok(true)
    }
}

/// Accepts every event without output.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckHandler;

#[async_trait]
impl EventHandler for AckHandler {
    fn name(&self) -> &str {
        "ack"
    }

    async fn handle(&self, _event: &Event, _context: &HandlerContext) -> Result<bool, HandlerError> {
        Ok(true)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        name: &'static str,
        result: fn() -> Result<bool, HandlerError>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for Scripted {
        fn name(&self) -> &str {
            self.name
        }
        async fn handle(&self, _e: &Event, _c: &HandlerContext) -> Result<bool, HandlerError> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn scripted(
        name: &'static str,
        result: fn() -> Result<bool, HandlerError>,
    ) -> (Arc<dyn EventHandler>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler: Arc<dyn EventHandler> = Arc::new(Scripted {
            name,
            result,
            calls: Arc::clone(&calls),
        });
        (handler, calls)
    }

    fn context() -> HandlerContext {
        HandlerContext {
            identity: AgentIdentity::new("scout"),
            server_url: "https://example.test/mcp".into(),
        }
    }

    fn handled() -> Result<bool, HandlerError> {
        Ok(true)
    }
    fn declined() -> Result<bool, HandlerError> {
        Ok(false)
    }
    fn failed() -> Result<bool, HandlerError> {
        Err(HandlerError::new("broken", "boom"))
    }

    #[tokio::test]
    async fn chain_short_circuits_on_first_handled() {
        let (a, a_calls) = scripted("a", declined);
        let (b, b_calls) = scripted("b", handled);
        let (c, c_calls) = scripted("c", handled);
        let d = HandlerDispatcher::new(vec![a, b, c], DispatchMode::Chain, context());

        assert!(d.dispatch(&Event::new("e1", "x")).await.unwrap());
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn broadcast_runs_every_handler() {
        let (a, a_calls) = scripted("a", handled);
        let (b, b_calls) = scripted("b", declined);
        let d = HandlerDispatcher::new(vec![a, b], DispatchMode::Broadcast, context());

        assert!(d.dispatch(&Event::new("e1", "x")).await.unwrap());
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nobody_handling_is_not_an_error() {
        let (a, _) = scripted("a", declined);
        let d = HandlerDispatcher::new(vec![a], DispatchMode::Chain, context());
        assert!(!d.dispatch(&Event::new("e1", "x")).await.unwrap());
    }

    #[tokio::test]
    async fn error_aborts_dispatch() {
        let (a, _) = scripted("a", failed);
        let (b, b_calls) = scripted("b", handled);
        let d = HandlerDispatcher::new(vec![a, b], DispatchMode::Broadcast, context());

        let err = d.dispatch(&Event::new("e1", "x")).await.unwrap_err();
        assert_eq!(err.handler, "broken");
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn registry_resolves_in_order() {
        let registry = HandlerRegistry::with_builtins();
        let handlers = registry.resolve(&["ack", "log"]).unwrap();
        let names: Vec<&str> = handlers.iter().map(|h| h.name()).collect();
        assert_eq!(names, vec!["ack", "log"]);
        assert_eq!(registry.keys(), vec!["ack", "log"]);
    }

    #[test]
    fn registry_rejects_unknown_and_empty() {
        let registry = HandlerRegistry::with_builtins();
        assert_matches!(
            registry.resolve(&["log", "pager"]).err(),
            Some(RegistryError::UnknownHandler { key, available }) if key == "pager" && available == "ack, log"
        );
        assert_matches!(registry.resolve::<&str>(&[]).err(), Some(RegistryError::Empty));
    }

    #[test]
    fn custom_factories_are_invoked_per_resolve() {
        let built = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = Arc::clone(&built);
        registry.register("count", move || -> Arc<dyn EventHandler> {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(AckHandler)
        });
        let _ = registry.resolve(&["count"]).unwrap();
        let _ = registry.resolve(&["count", "count"]).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn builtins_report_handled() {
        let event = Event::new("e1", "hello").with_sender("alice");
        assert!(LogHandler.handle(&event, &context()).await.unwrap());
        assert!(AckHandler.handle(&event, &context()).await.unwrap());
    }

    #[test]
    fn mode_from_flag() {
        assert_eq!(DispatchMode::from_chain_flag(true), DispatchMode::Chain);
        assert_eq!(DispatchMode::from_chain_flag(false), DispatchMode::Broadcast);
    }
}
