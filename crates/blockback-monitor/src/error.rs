//! Error types for the monitor layer.

use blockback_error::CommonError;
use thiserror::Error;

/// Result type alias for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Errors that can occur while talking to the monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Common errors (I/O, not found, timeouts, etc.).
    #[error(transparent)]
    Common(#[from] CommonError),

    /// The monitor returned a response the engine could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The monitor rejected a command.
    #[error("command '{verb}' failed: {desc}")]
    CommandFailed {
        /// The concrete verb that was sent.
        verb: String,
        /// The monitor's error description.
        desc: String,
    },

    /// Neither the stable nor the experimental verb is supported.
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),
}

impl MonitorError {
    /// Creates a new protocol error.
    #[must_use]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Creates a new command failure.
    #[must_use]
    pub fn command_failed(verb: impl Into<String>, desc: impl Into<String>) -> Self {
        Self::CommandFailed {
            verb: verb.into(),
            desc: desc.into(),
        }
    }

    /// Returns true if this is an unsupported-command error.
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedCommand(_))
    }
}

impl From<std::io::Error> for MonitorError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::from(err))
    }
}
