//! Netprobe error types.
//!
//! # Error classes
//!
//! The reactor distinguishes two classes of failure coming out of callbacks:
//!
//! - **Isolated**: every variant except [`ProbeError::Terminated`]. The reactor
//!   logs it and keeps running; a failing I/O handler is force-closed.
//! - **Terminating**: [`ProbeError::Terminated`] propagates out of
//!   [`Reactor::run_once`](crate::reactor::Reactor::run_once) and stops the
//!   loop.

use thiserror::Error;

/// Netprobe errors.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// The process was asked to stop; never swallowed by the reactor.
    #[error("Terminated: {0}")]
    Terminated(String),

    /// A peer answered with a non-success status.
    #[error("Bad response: {code} {reason}")]
    BadResponse {
        /// Status code received.
        code: u16,
        /// Reason phrase received.
        reason: String,
    },

    /// A payload could not be understood.
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// A `Range` header could not be parsed.
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// A transport connection failed or was lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The speedtest controller is in a state that cannot accept the event.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    /// Whether this error must stop the reactor instead of being isolated.
    pub fn is_terminating(&self) -> bool {
        matches!(self, ProbeError::Terminated(_))
    }
}

/// Result type alias for netprobe operations
pub type Result<T> = std::result::Result<T, ProbeError>;

impl From<toml::de::Error> for ProbeError {
    fn from(err: toml::de::Error) -> Self {
        ProbeError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_terminated_is_terminating() {
        assert!(ProbeError::Terminated("SIGINT".into()).is_terminating());
        assert!(!ProbeError::Connection("reset".into()).is_terminating());
        assert!(!ProbeError::Io(std::io::Error::other("boom")).is_terminating());
    }

    #[test]
    fn test_bad_response_display() {
        let err = ProbeError::BadResponse {
            code: 500,
            reason: "Internal Server Error".into(),
        };
        assert_eq!(err.to_string(), "Bad response: 500 Internal Server Error");
    }
}
