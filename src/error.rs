//! Error types for rocketchat-realtime

use thiserror::Error;

/// Every failure the realtime client can report.
///
/// The type is `Clone` because a single terminal stream error is handed to
/// every call that was pending when the receive loop died.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Bootstrap never completed: {0}")]
    BootstrapFailed(#[source] Box<RealtimeError>),

    #[error("Session closed: {0}")]
    SessionClosed(#[source] Box<RealtimeError>),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Method {method} failed: {message}")]
    Method { method: String, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RealtimeError {
    /// Wrap a failure that happened before the session became ready.
    pub fn bootstrap(cause: RealtimeError) -> Self {
        match cause {
            already @ RealtimeError::BootstrapFailed(_) => already,
            other => RealtimeError::BootstrapFailed(Box::new(other)),
        }
    }

    /// Wrap a failure that ended a session after it became ready.
    pub fn session_closed(cause: RealtimeError) -> Self {
        match cause {
            already @ RealtimeError::SessionClosed(_) => already,
            other => RealtimeError::SessionClosed(Box::new(other)),
        }
    }

    /// The underlying cause of a bootstrap or session failure.
    pub fn root_cause(&self) -> &RealtimeError {
        match self {
            RealtimeError::BootstrapFailed(inner) | RealtimeError::SessionClosed(inner) => {
                inner.root_cause()
            }
            other => other,
        }
    }
}

impl From<serde_json::Error> for RealtimeError {
    fn from(e: serde_json::Error) -> Self {
        RealtimeError::Decode(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RealtimeError::Transport(e.to_string())
    }
}
