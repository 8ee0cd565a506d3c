//! Custom error types for the chamber driver.
//!
//! `ChamberError` is the single error type returned by the session, the
//! program author and the telemetry poller. It follows the fault taxonomy of
//! the driver:
//!
//! - **`Transport`** / **`NotConnected`**: the instrument channel is broken or
//!   was never established. Fatal to the session; nothing is retried.
//! - **`Persistence`**: the durable telemetry log cannot be opened or written.
//!   Fatal to the poller and, through it, to the whole session.
//! - **`Config`**, **`InvalidProgram`**, **`InvalidCommand`**: rejected before
//!   any byte reaches the instrument.
//!
//! A negative acknowledgement from the instrument is *not* an error. Those are
//! reported as ordinary values (`Ack::Nok`, `None`, `ProgramWrite::Aborted`).

use crate::config::ConfigError;
use crate::transport::TransportError;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type AppResult<T> = std::result::Result<T, ChamberError>;

/// Errors surfaced by the chamber driver
#[derive(Error, Debug)]
pub enum ChamberError {
    /// The wire failed; the session is no longer usable
    #[error("Transport fault: {0}")]
    Transport(#[from] TransportError),

    /// No open transport
    #[error("Not connected to instrument")]
    NotConnected,

    /// The telemetry log could not be written
    #[error("Cannot write telemetry log '{}': {source}", path.display())]
    Persistence {
        /// Log file
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A ramp program failed validation
    #[error("Invalid program: {0}")]
    InvalidProgram(String),

    /// Operator input could not be used
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The requested back-end was compiled out
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Other I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChamberError {
    /// Whether this error terminates a running session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChamberError::Transport(_) | ChamberError::NotConnected | ChamberError::Persistence { .. }
        )
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ChamberError::Persistence {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChamberError::InvalidProgram("no steps".to_string());
        assert_eq!(err.to_string(), "Invalid program: no steps");
    }

    #[test]
    fn test_persistence_error_names_path() {
        let err = ChamberError::persistence(
            "/tmp/results.csv",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(err.to_string().contains("/tmp/results.csv"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_protocol_level_errors_are_not_fatal() {
        assert!(!ChamberError::InvalidCommand("x".into()).is_fatal());
        assert!(ChamberError::Transport(TransportError::Closed).is_fatal());
    }
}
