//! # blockback-core
//!
//! Incremental block-backup and dirty-bitmap coordination engine.
//!
//! The engine drives an external block layer through the
//! [`Monitor`](blockback_monitor::Monitor) seam: it materializes backup
//! target nodes, starts full and incremental backup jobs, and manages the
//! lifecycle of the dirty bitmaps that track guest writes between backups.
//! It holds no durable state of its own; all truth lives in the monitor and
//! every mutating bitmap operation is confirmed by a read-back query.
//!
//! Modules, bottom-up:
//!
//! - [`job`]: polls asynchronous jobs to their concluded state and dismisses
//!   them.
//! - [`bitmap`]: the dirty-bitmap state machine (add, disable, merge, clear,
//!   remove) with post-condition assertions.
//! - [`node`]: two-stage construction of backing-file + format-layer node
//!   pairs, optionally chained onto a previous backup target.
//! - [`backup`]: the orchestrator tying targets, bitmaps, and jobs into
//!   full/incremental backup chains.
//! - [`provision`]: the storage-provisioner seam that names and cleans up
//!   target image files.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod backup;
pub mod bitmap;
pub mod config;
pub mod error;
pub mod id;
pub mod job;
pub mod node;
pub mod provision;

pub use backup::{BackupChain, BackupOrchestrator, JobHandle};
pub use bitmap::BitmapRegistry;
pub use config::BackupConfig;
pub use error::{BackupError, Result};
pub use job::JobTracker;
pub use node::{BackingSpec, BlockNodeBuilder, CreatedNode, Stage, TargetSpec};
pub use provision::{LocalDirProvisioner, StorageProvisioner};
