//! Error types for the backup engine.

use blockback_error::CommonError;
use blockback_monitor::MonitorError;
use thiserror::Error;

use crate::node::Stage;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors that can occur while coordinating backups.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Common errors (not found, already exists, invalid state, timeout).
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Monitor-level failure (protocol error, rejected or unsupported
    /// command).
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    /// A post-condition read-back did not observe the expected state.
    ///
    /// The protocol commands are fire-and-forget, so every mutating bitmap
    /// operation is confirmed by re-querying; a mismatch is a logic or
    /// environment fault and is never retried.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Target node construction failed partway through.
    ///
    /// Artifacts from earlier stages are not rolled back; cleanup is the
    /// caller's responsibility.
    #[error("node creation failed at stage '{stage}': {source}")]
    NodeCreationFailed {
        /// The stage that failed.
        stage: Stage,
        /// The underlying failure.
        #[source]
        source: Box<BackupError>,
    },
}

impl BackupError {
    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::Common(CommonError::not_found(resource))
    }

    /// Creates a new already exists error.
    #[must_use]
    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::Common(CommonError::already_exists(resource))
    }

    /// Creates a new invalid state error.
    #[must_use]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::Common(CommonError::invalid_state(msg))
    }

    /// Creates a new timeout error.
    #[must_use]
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Common(CommonError::timeout(msg))
    }

    /// Creates a new invariant violation.
    #[must_use]
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Wraps a failure with the node-construction stage it occurred in.
    #[must_use]
    pub fn at_stage(stage: Stage, source: Self) -> Self {
        Self::NodeCreationFailed {
            stage,
            source: Box::new(source),
        }
    }

    /// Returns true if this is a not found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Common(CommonError::NotFound(_)))
    }

    /// Returns true if this is an invariant violation.
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }

    /// Returns true if this is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Common(CommonError::Timeout(_)))
    }

    /// Returns true if this is an invalid state error.
    #[must_use]
    pub const fn is_invalid_state(&self) -> bool {
        matches!(self, Self::Common(CommonError::InvalidState(_)))
    }
}

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::from(err))
    }
}
