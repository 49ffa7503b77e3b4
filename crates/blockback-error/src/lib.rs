//! Common error types for blockback.
//!
//! This crate provides the unified error vocabulary shared by the monitor and
//! core crates, so that lookup failures, state-machine violations, and
//! timeouts read the same everywhere.
//!
//! # Crate-Specific Errors
//!
//! Each crate defines its own error type that wraps `CommonError`:
//!
//! ```rust,ignore
//! use blockback_error::CommonError;
//! use thiserror::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum MyError {
//!     #[error(transparent)]
//!     Common(#[from] CommonError),
//!
//!     #[error("my specific error: {0}")]
//!     Specific(String),
//! }
//! ```

mod common;

pub use common::CommonError;

/// Result type alias using `CommonError`.
pub type Result<T> = std::result::Result<T, CommonError>;
