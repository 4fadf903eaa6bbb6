//! Runtime error types.

/// Processed-event store failure.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    /// `SQLite` error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Creating the database directory failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A handler failed on an event. The event stays unprocessed.
#[derive(Debug, thiserror::Error)]
#[error("handler '{handler}' failed: {message}")]
pub struct HandlerError {
    /// Name of the failing handler.
    pub handler: String,
    /// Failure description.
    pub message: String,
}

impl HandlerError {
    /// Build an error attributed to `handler`.
    pub fn new(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            message: message.into(),
        }
    }
}

/// Handler selection could not be resolved at startup.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No factory is registered under the key.
    #[error("unknown handler '{key}' (available: {available})")]
    UnknownHandler {
        /// Requested key.
        key: String,
        /// Comma-separated registered keys.
        available: String,
    },

    /// The selection is empty.
    #[error("no handlers selected")]
    Empty,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_display() {
        let err = HandlerError::new("log", "disk full");
        assert_eq!(err.to_string(), "handler 'log' failed: disk full");
    }

    #[test]
    fn unknown_handler_lists_available() {
        let err = RegistryError::UnknownHandler {
            key: "pager".into(),
            available: "ack, log".into(),
        };
        assert_eq!(
            err.to_string(),
            "unknown handler 'pager' (available: ack, log)"
        );
    }
}
