//! Block node construction.
//!
//! A backup target is a pair of graph nodes: a protocol-layer node over the
//! raw backing file, and a format-layer node on top of it. The protocol
//! separates allocating storage (an asynchronous `blockdev-create` job) from
//! inserting the node into the graph (`blockdev-add`), so building a target
//! takes four stages:
//!
//! 1. create the backing file (job: await + dismiss)
//! 2. add the protocol node
//! 3. create the format layer (job: await + dismiss), chained onto a
//!    backing image when requested
//! 4. add the format node — its name is the backup target thereafter
//!
//! A failure aborts the remaining stages and names the stage that failed.
//! Nothing is rolled back; partially created files may need
//! provisioner-level cleanup by the caller.

use crate::error::{BackupError, Result};
use crate::id;
use crate::job::JobTracker;
use blockback_monitor::qmp::{self, AddOptions, BlockdevCreateRequest, CreateOptions};
use blockback_monitor::Monitor;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Construction stage, named in `NodeCreationFailed` errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Allocating the raw backing file.
    CreateBackingStore,
    /// Inserting the protocol-layer node.
    AddProtocolNode,
    /// Formatting the protocol node.
    CreateFormatLayer,
    /// Inserting the format-layer node.
    AddFormatNode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateBackingStore => "create-backing-store",
            Self::AddProtocolNode => "add-protocol-node",
            Self::CreateFormatLayer => "create-format-layer",
            Self::AddFormatNode => "add-format-node",
        };
        f.write_str(name)
    }
}

/// Chain link to a previous backup target.
#[derive(Debug, Clone)]
pub struct BackingSpec {
    /// Node name of the previous target.
    pub node: String,
    /// On-disk path of the previous target's image.
    pub file: PathBuf,
}

/// What to build.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    /// On-disk path for the new image file.
    pub filename: PathBuf,
    /// Virtual size of the format layer, in bytes.
    pub size: u64,
    /// Previous target to chain onto, for incremental targets.
    pub backing: Option<BackingSpec>,
    /// Format-layer cluster size, when configured.
    pub cluster_size: Option<u64>,
}

/// A fully constructed target node pair.
#[derive(Debug, Clone)]
pub struct CreatedNode {
    /// Format-layer node name; used as the backup target.
    pub node_name: String,
    /// Protocol-layer node name underneath it.
    pub protocol_node: String,
    /// On-disk path of the image file.
    pub filename: PathBuf,
}

/// Builds backing-file + format-layer node pairs.
#[derive(Clone)]
pub struct BlockNodeBuilder {
    monitor: Arc<dyn Monitor>,
    jobs: JobTracker,
    job_timeout: Duration,
}

impl BlockNodeBuilder {
    /// Creates a builder that awaits creation jobs within `job_timeout`.
    #[must_use]
    pub fn new(monitor: Arc<dyn Monitor>, jobs: JobTracker, job_timeout: Duration) -> Self {
        Self {
            monitor,
            jobs,
            job_timeout,
        }
    }

    /// Builds a target node pair, returning the format-layer node name to
    /// back up into.
    pub async fn create_target(&self, spec: &TargetSpec) -> Result<CreatedNode> {
        let node_name = id::prefixed_id("target");
        let protocol_node = format!("{node_name}-file");
        let filename = spec.filename.to_string_lossy().into_owned();
        tracing::info!(
            node = %node_name,
            file = %filename,
            backing = spec.backing.as_ref().map(|b| b.node.as_str()),
            "creating backup target node"
        );

        self.create_backing_store(&filename)
            .await
            .map_err(|e| BackupError::at_stage(Stage::CreateBackingStore, e))?;

        self.add_node(AddOptions::File {
            node_name: protocol_node.clone(),
            filename: filename.clone(),
        })
        .await
        .map_err(|e| BackupError::at_stage(Stage::AddProtocolNode, e))?;

        self.create_format_layer(&protocol_node, spec)
            .await
            .map_err(|e| BackupError::at_stage(Stage::CreateFormatLayer, e))?;

        self.add_node(AddOptions::Qcow2 {
            node_name: node_name.clone(),
            file: protocol_node.clone(),
            backing: spec.backing.as_ref().map(|b| b.node.clone()),
        })
        .await
        .map_err(|e| BackupError::at_stage(Stage::AddFormatNode, e))?;

        Ok(CreatedNode {
            node_name,
            protocol_node,
            filename: spec.filename.clone(),
        })
    }

    async fn create_backing_store(&self, filename: &str) -> Result<()> {
        let job_id = id::random_id();
        let request = BlockdevCreateRequest {
            job_id: job_id.clone(),
            // The raw file is grown by the format layer; it starts empty.
            options: CreateOptions::File {
                filename: filename.to_string(),
                size: 0,
            },
        };
        qmp::blockdev_create(self.monitor.as_ref(), &request).await?;
        self.jobs
            .await_concluded_and_dismiss(&job_id, self.job_timeout)
            .await
    }

    async fn create_format_layer(&self, protocol_node: &str, spec: &TargetSpec) -> Result<()> {
        let job_id = id::random_id();
        let request = BlockdevCreateRequest {
            job_id: job_id.clone(),
            options: CreateOptions::Qcow2 {
                file: protocol_node.to_string(),
                size: spec.size,
                backing_file: spec
                    .backing
                    .as_ref()
                    .map(|b| b.file.to_string_lossy().into_owned()),
                backing_fmt: spec.backing.as_ref().map(|_| "qcow2".to_string()),
                cluster_size: spec.cluster_size,
            },
        };
        qmp::blockdev_create(self.monitor.as_ref(), &request).await?;
        self.jobs
            .await_concluded_and_dismiss(&job_id, self.job_timeout)
            .await
    }

    async fn add_node(&self, options: AddOptions) -> Result<()> {
        qmp::blockdev_add(self.monitor.as_ref(), &options).await?;
        tracing::debug!(node = options.node_name(), "node added to block graph");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockback_monitor::testing::FakeMonitor;

    const POLL: Duration = Duration::from_millis(10);
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn builder(fake: &Arc<FakeMonitor>) -> BlockNodeBuilder {
        let monitor = Arc::clone(fake) as Arc<dyn Monitor>;
        let jobs = JobTracker::new(Arc::clone(&monitor), POLL);
        BlockNodeBuilder::new(monitor, jobs, TIMEOUT)
    }

    fn spec(filename: &str) -> TargetSpec {
        TargetSpec {
            filename: PathBuf::from(filename),
            size: 1 << 30,
            backing: None,
            cluster_size: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_target_registers_exactly_one_node() {
        let fake = Arc::new(FakeMonitor::new());
        let created = builder(&fake)
            .create_target(&spec("/imgs/t0.qcow2"))
            .await
            .unwrap();
        let nodes = qmp::query_named_block_nodes(fake.as_ref()).await.unwrap();
        let matching: Vec<_> = nodes
            .iter()
            .filter(|n| n.node_name == created.node_name)
            .collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].drv, "qcow2");
        assert!(fake.node_exists(&created.protocol_node));
    }

    #[tokio::test(start_paused = true)]
    async fn test_creation_jobs_are_dismissed() {
        let fake = Arc::new(FakeMonitor::new());
        builder(&fake)
            .create_target(&spec("/imgs/t0.qcow2"))
            .await
            .unwrap();
        let jobs = qmp::query_jobs(fake.as_ref()).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chained_target_references_backing() {
        let fake = Arc::new(FakeMonitor::new());
        let builder = builder(&fake);
        let base = builder.create_target(&spec("/imgs/t0.qcow2")).await.unwrap();
        let mut chained = spec("/imgs/t1.qcow2");
        chained.backing = Some(BackingSpec {
            node: base.node_name.clone(),
            file: base.filename.clone(),
        });
        let incr = builder.create_target(&chained).await.unwrap();
        let info = qmp::find_block_node(fake.as_ref(), &incr.node_name)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.backing_file.as_deref(), Some("/imgs/t0.qcow2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_names_the_failing_stage() {
        let fake = Arc::new(FakeMonitor::new());
        let mut bad = spec("/imgs/t1.qcow2");
        // Chains onto an image that was never created.
        bad.backing = Some(BackingSpec {
            node: "ghost".to_string(),
            file: PathBuf::from("/imgs/ghost.qcow2"),
        });
        let err = builder(&fake).create_target(&bad).await.unwrap_err();
        match err {
            BackupError::NodeCreationFailed { stage, .. } => {
                assert_eq!(stage, Stage::CreateFormatLayer);
            }
            other => panic!("expected NodeCreationFailed, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_stage_failure_aborts_remaining_stages() {
        let fake = Arc::new(FakeMonitor::without_command("blockdev-create"));
        let err = builder(&fake)
            .create_target(&spec("/imgs/t0.qcow2"))
            .await
            .unwrap_err();
        match err {
            BackupError::NodeCreationFailed { stage, .. } => {
                assert_eq!(stage, Stage::CreateBackingStore);
            }
            other => panic!("expected NodeCreationFailed, got {other}"),
        }
        assert_eq!(fake.sent_count("blockdev-add"), 0);
    }
}
