//! Common error types shared across blockback crates.

use thiserror::Error;

/// Common errors that occur across multiple blockback crates.
///
/// This enum covers the failure modes that every layer of the engine runs
/// into: lookups of nodes, bitmaps, and jobs; state-machine preconditions;
/// and bounded waits. Crate-specific errors wrap this type via `#[from]`.
#[derive(Debug, Error)]
pub enum CommonError {
    /// I/O error from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    ///
    /// Invalid or missing configuration values, or a malformed config file.
    #[error("configuration error: {0}")]
    Config(String),

    /// Resource not found.
    ///
    /// A requested block node, dirty bitmap, or job does not exist in the
    /// monitor's state.
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    ///
    /// Creating a bitmap or node under a name that is already taken.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Invalid state for the requested operation.
    ///
    /// For example, dismissing a job that has not concluded.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Bounded wait expired.
    ///
    /// A job did not reach the awaited status within its polling budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Internal error.
    ///
    /// Catch-all for unexpected conditions; includes context for debugging.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommonError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Creates a new already exists error.
    #[must_use]
    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::AlreadyExists(resource.into())
    }

    /// Creates a new invalid state error.
    #[must_use]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Creates a new timeout error.
    #[must_use]
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if this is a not found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if this is an already exists error.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Returns true if this is an invalid state error.
    #[must_use]
    pub const fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }

    /// Returns true if this is a timeout error.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
