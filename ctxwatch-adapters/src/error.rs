//! Error types for bridge calls.

use thiserror::Error;

/// Errors a bridge call can fail with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The bridge didn't answer in time.
    #[error("Bridge request timed out")]
    Timeout,

    /// The bridge service itself can't be reached.
    #[error("Bridge unavailable: {0}")]
    Unavailable(String),

    /// The context no longer exists (closed tab, terminated worker).
    #[error("Context gone: {0}")]
    ContextGone(String),

    /// The bridge answered with something we couldn't interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An expression evaluated in the context threw.
    #[error("Script error: {0}")]
    Script(String),
}

impl BridgeError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::Timeout | BridgeError::Unavailable(_))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Protocol(err.to_string())
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BridgeError::Timeout
        } else if err.is_connect() {
            BridgeError::Unavailable(err.to_string())
        } else if err.is_decode() {
            BridgeError::Protocol(err.to_string())
        } else {
            BridgeError::Unavailable(err.to_string())
        }
    }
}
