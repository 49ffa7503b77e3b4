//! Backup orchestration.
//!
//! The orchestrator ties the other components into backup chains: it
//! provisions and materializes target nodes, starts full and incremental
//! backup jobs, and keeps each new target chained onto the previous one so
//! every incremental backup preserves point-in-time consistency.
//!
//! For a full backup, the initial tracking bitmaps are created in the same
//! atomic transaction as the backup job, so no write can slip in untracked
//! between target creation and tracking start. For an incremental backup,
//! the consumed bitmap is disabled first (automatically, when still active)
//! so the job reads a stable change-set.

use crate::bitmap::BitmapRegistry;
use crate::config::BackupConfig;
use crate::error::{BackupError, Result};
use crate::id;
use crate::job::JobTracker;
use crate::node::{BackingSpec, BlockNodeBuilder, CreatedNode, TargetSpec};
use crate::provision::StorageProvisioner;
use blockback_monitor::qmp::{self, BackupRequest, BitmapAddRequest, BitmapState, SyncMode};
use blockback_monitor::{CommandNegotiator, Monitor, Transaction, TransactionAction};
use std::sync::Arc;

/// Handle to a started backup job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    /// Job id to poll and dismiss.
    pub id: String,
    /// Source device.
    pub device: String,
    /// Target node.
    pub target: String,
}

/// Successive backup targets for one source device.
///
/// The newest target is the backing node for the next incremental target.
#[derive(Debug, Default)]
pub struct BackupChain {
    device: String,
    targets: Vec<CreatedNode>,
}

impl BackupChain {
    /// Starts an empty chain for a source device.
    #[must_use]
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            targets: Vec::new(),
        }
    }

    /// The source device this chain backs up.
    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    /// The most recent target, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&CreatedNode> {
        self.targets.last()
    }

    /// Number of targets created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Returns true when no target has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Top-level coordinator for backup chains.
pub struct BackupOrchestrator {
    monitor: Arc<dyn Monitor>,
    negotiator: Arc<CommandNegotiator>,
    bitmaps: BitmapRegistry,
    jobs: JobTracker,
    nodes: BlockNodeBuilder,
    provisioner: Arc<dyn StorageProvisioner>,
    config: BackupConfig,
}

impl BackupOrchestrator {
    /// Wires up an orchestrator over one monitor session.
    #[must_use]
    pub fn new(
        monitor: Arc<dyn Monitor>,
        provisioner: Arc<dyn StorageProvisioner>,
        config: BackupConfig,
    ) -> Self {
        let negotiator = Arc::new(CommandNegotiator::new());
        let jobs = JobTracker::new(Arc::clone(&monitor), config.poll_interval());
        let bitmaps = BitmapRegistry::new(
            Arc::clone(&monitor),
            Arc::clone(&negotiator),
            config.clear_settle(),
        );
        let nodes = BlockNodeBuilder::new(Arc::clone(&monitor), jobs.clone(), config.job_timeout());
        Self {
            monitor,
            negotiator,
            bitmaps,
            jobs,
            nodes,
            provisioner,
            config,
        }
    }

    /// The bitmap registry bound to this session.
    #[must_use]
    pub const fn bitmaps(&self) -> &BitmapRegistry {
        &self.bitmaps
    }

    /// The job tracker bound to this session.
    #[must_use]
    pub const fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    /// Provisions an image and builds the next target node for the chain.
    ///
    /// The first target stands alone; every later target is chained with
    /// `backing` pointing at the previous one.
    pub async fn create_target(&self, chain: &mut BackupChain, size: u64) -> Result<String> {
        let image_name = id::prefixed_id("bak");
        let path = self.provisioner.create_image(&image_name, size).await?;
        let spec = TargetSpec {
            filename: path,
            size,
            backing: chain.latest().map(|prev| BackingSpec {
                node: prev.node_name.clone(),
                file: prev.filename.clone(),
            }),
            cluster_size: self.config.image.cluster_size,
        };
        let created = self.nodes.create_target(&spec).await?;
        tracing::info!(
            device = chain.device(),
            target = %created.node_name,
            generation = chain.len() + 1,
            "backup target ready"
        );
        let node_name = created.node_name.clone();
        chain.targets.push(created);
        Ok(node_name)
    }

    /// Starts a full backup of `device` into an existing target node.
    pub async fn full_backup(&self, device: &str, target: &str) -> Result<JobHandle> {
        self.ensure_target(target).await?;
        let request = BackupRequest {
            job_id: id::random_id(),
            device: device.to_string(),
            target: target.to_string(),
            sync: SyncMode::Full,
            bitmap: None,
        };
        qmp::blockdev_backup(self.monitor.as_ref(), &request).await?;
        tracing::info!(device, target, job_id = %request.job_id, "full backup started");
        Ok(JobHandle {
            id: request.job_id,
            device: device.to_string(),
            target: target.to_string(),
        })
    }

    /// Starts a full backup and creates the initial tracking bitmaps in the
    /// same atomic transaction.
    pub async fn full_backup_with_bitmaps(
        &self,
        device: &str,
        target: &str,
        bitmaps: &[&str],
    ) -> Result<JobHandle> {
        self.ensure_target(target).await?;
        let backup_cmd = self
            .negotiator
            .resolve(self.monitor.as_ref(), "blockdev-backup")
            .await?;
        let add_cmd = self
            .negotiator
            .resolve(self.monitor.as_ref(), "block-dirty-bitmap-add")
            .await?;

        let request = BackupRequest {
            job_id: id::random_id(),
            device: device.to_string(),
            target: target.to_string(),
            sync: SyncMode::Full,
            bitmap: None,
        };
        let mut transaction = Transaction::new();
        transaction.push(TransactionAction::from_request(&backup_cmd, &request)?);
        for name in bitmaps {
            let add = BitmapAddRequest {
                node: device.to_string(),
                name: (*name).to_string(),
                persistent: None,
            };
            transaction.push(TransactionAction::from_request(&add_cmd, &add)?);
        }
        transaction.submit(self.monitor.as_ref()).await?;
        tracing::info!(
            device,
            target,
            job_id = %request.job_id,
            ?bitmaps,
            "full backup and tracking bitmaps started atomically"
        );
        Ok(JobHandle {
            id: request.job_id,
            device: device.to_string(),
            target: target.to_string(),
        })
    }

    /// Starts an incremental backup of `device` into an existing target,
    /// consuming `bitmap` as the change-set.
    ///
    /// The bitmap must exist; if it is still active it is disabled first so
    /// the job reads a stable change-set. The bitmap is treated as an opaque
    /// handle; the orchestrator never inspects its content.
    pub async fn incremental_backup(
        &self,
        device: &str,
        target: &str,
        bitmap: &str,
    ) -> Result<JobHandle> {
        self.ensure_target(target).await?;
        let info = self
            .bitmaps
            .query_by_name(device, bitmap)
            .await?
            .ok_or_else(|| {
                BackupError::not_found(format!("bitmap '{bitmap}' on node '{device}'"))
            })?;
        if info.state() == BitmapState::Active {
            tracing::debug!(device, bitmap, "disabling bitmap before incremental backup");
            self.bitmaps.disable(device, bitmap).await?;
        }
        let request = BackupRequest {
            job_id: id::random_id(),
            device: device.to_string(),
            target: target.to_string(),
            sync: SyncMode::Incremental,
            bitmap: Some(bitmap.to_string()),
        };
        qmp::blockdev_backup(self.monitor.as_ref(), &request).await?;
        tracing::info!(
            device,
            target,
            bitmap,
            job_id = %request.job_id,
            "incremental backup started"
        );
        Ok(JobHandle {
            id: request.job_id,
            device: device.to_string(),
            target: target.to_string(),
        })
    }

    /// Waits for a backup job to conclude and dismisses it.
    pub async fn await_backup(&self, handle: &JobHandle) -> Result<()> {
        self.jobs
            .await_concluded_and_dismiss(&handle.id, self.config.job_timeout())
            .await?;
        tracing::info!(
            device = %handle.device,
            target = %handle.target,
            job_id = %handle.id,
            "backup concluded"
        );
        Ok(())
    }

    async fn ensure_target(&self, target: &str) -> Result<()> {
        qmp::find_block_node(self.monitor.as_ref(), target)
            .await?
            .map(|_| ())
            .ok_or_else(|| BackupError::not_found(format!("target node '{target}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BitmapConfig, JobConfig};
    use crate::provision::LocalDirProvisioner;
    use blockback_monitor::testing::FakeMonitor;

    fn test_config(data_dir: &std::path::Path) -> BackupConfig {
        BackupConfig {
            data_dir: data_dir.to_path_buf(),
            job: JobConfig {
                poll_interval_ms: 10,
                timeout_secs: 5,
            },
            bitmap: BitmapConfig { clear_settle_ms: 10 },
            image: crate::config::ImageConfig::default(),
        }
    }

    fn orchestrator(
        fake: &Arc<FakeMonitor>,
        data_dir: &std::path::Path,
    ) -> BackupOrchestrator {
        BackupOrchestrator::new(
            Arc::clone(fake) as Arc<dyn Monitor>,
            Arc::new(LocalDirProvisioner::new(data_dir)),
            test_config(data_dir),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_backup_requires_existing_target() {
        let fake = Arc::new(FakeMonitor::new());
        fake.insert_device("d0");
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&fake, dir.path());
        let err = orch.full_backup("d0", "ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_backup_with_bitmaps_is_one_transaction() {
        let fake = Arc::new(FakeMonitor::new());
        fake.insert_device("d0");
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&fake, dir.path());
        let mut chain = BackupChain::new("d0");
        let target = orch.create_target(&mut chain, 1 << 20).await.unwrap();

        let handle = orch
            .full_backup_with_bitmaps("d0", &target, &["b1", "b2"])
            .await
            .unwrap();
        assert_eq!(fake.sent_count("transaction"), 1);
        assert_eq!(fake.sent_count("blockdev-backup"), 0);
        for name in ["b1", "b2"] {
            let info = orch.bitmaps().query_by_name("d0", name).await.unwrap();
            assert!(info.is_some(), "bitmap {name} missing");
        }
        orch.await_backup(&handle).await.unwrap();
        assert!(!fake.job_exists(&handle.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_transaction_creates_nothing() {
        let fake = Arc::new(FakeMonitor::new());
        fake.insert_device("d0");
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&fake, dir.path());
        let mut chain = BackupChain::new("d0");
        let target = orch.create_target(&mut chain, 1 << 20).await.unwrap();

        // Duplicate bitmap name makes the batch fail as a whole.
        let err = orch
            .full_backup_with_bitmaps("d0", &target, &["b1", "b1"])
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Monitor(_)));
        assert!(orch
            .bitmaps()
            .query_by_name("d0", "b1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_backup_auto_disables_active_bitmap() {
        let fake = Arc::new(FakeMonitor::new());
        fake.insert_device("d0");
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&fake, dir.path());
        let mut chain = BackupChain::new("d0");
        let target = orch.create_target(&mut chain, 1 << 20).await.unwrap();

        orch.bitmaps()
            .add("d0", "b1", qmp::Persistence::Default)
            .await
            .unwrap();
        fake.write("d0", &[0, 1]);
        let handle = orch.incremental_backup("d0", &target, "b1").await.unwrap();
        let info = orch
            .bitmaps()
            .query_by_name("d0", "b1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.state(), BitmapState::Disabled);
        orch.await_backup(&handle).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_backup_requires_bitmap() {
        let fake = Arc::new(FakeMonitor::new());
        fake.insert_device("d0");
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&fake, dir.path());
        let mut chain = BackupChain::new("d0");
        let target = orch.create_target(&mut chain, 1 << 20).await.unwrap();
        let err = orch
            .incremental_backup("d0", &target, "ghost")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successive_targets_chain_onto_previous() {
        let fake = Arc::new(FakeMonitor::new());
        fake.insert_device("d0");
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&fake, dir.path());
        let mut chain = BackupChain::new("d0");
        let first = orch.create_target(&mut chain, 1 << 20).await.unwrap();
        let second = orch.create_target(&mut chain, 1 << 20).await.unwrap();
        assert_eq!(chain.len(), 2);

        let first_file = qmp::find_block_node(fake.as_ref(), &first)
            .await
            .unwrap()
            .unwrap()
            .file
            .unwrap();
        let info = qmp::find_block_node(fake.as_ref(), &second)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.backing_file.as_deref(), Some(first_file.as_str()));
    }
}
