//! # blockback-monitor
//!
//! Monitor abstraction for the blockback engine.
//!
//! This crate owns everything that touches the block-layer control protocol
//! directly:
//!
//! - [`Monitor`]: the single-method seam through which every protocol command
//!   is issued. Transport bindings live behind this trait; the engine never
//!   sees sockets or framing.
//! - [`command`]: the command registry and [`CommandNegotiator`], which map a
//!   logical command name to the concrete verb (stable or `x-` experimental)
//!   supported by the connected monitor.
//! - [`transaction`]: atomic multi-action batches with stable/experimental
//!   field normalization.
//! - [`qmp`]: typed request and response structures plus thin command
//!   wrappers over [`Monitor::send`].
//! - [`testing`]: an in-memory [`FakeMonitor`](testing::FakeMonitor) that
//!   models nodes, bitmaps, and jobs, for tests that drive the engine
//!   without a live block layer.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod command;
pub mod error;
pub mod qmp;
pub mod testing;
pub mod transaction;

pub use command::{CommandForm, CommandNegotiator, ResolvedCommand};
pub use error::{MonitorError, Result};
pub use transaction::{Transaction, TransactionAction};

use async_trait::async_trait;
use serde_json::Value;

/// The control-protocol seam.
///
/// A monitor accepts one command at a time and returns the structured
/// response. Implementations are serialized request/response channels; the
/// engine never issues logically dependent commands concurrently.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Sends one protocol command and returns its `return` payload.
    ///
    /// `arguments` is the command's argument object, or `Value::Null` for
    /// commands that take none. A protocol-level error response surfaces as
    /// [`MonitorError::CommandFailed`].
    async fn send(&self, verb: &str, arguments: Value) -> Result<Value>;
}
