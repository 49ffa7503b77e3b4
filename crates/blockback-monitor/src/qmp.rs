//! Typed protocol requests, responses, and thin command wrappers.
//!
//! Every request the engine issues is built from one of these structs and
//! serialized with the wire's kebab-case field names; ad-hoc string-keyed
//! maps appear only where a command's verb itself is negotiated at runtime
//! (the dirty-bitmap family, see `blockback-core`).

use crate::error::{MonitorError, Result};
use crate::Monitor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of an asynchronous block-layer job.
///
/// Only `Concluded` is terminal for this engine; everything else counts as
/// "still in flight" while polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Undefined,
    Created,
    Running,
    Paused,
    Ready,
    Standby,
    #[serde(rename = "waiting")]
    WaitingForInput,
    Pending,
    Aborting,
    Concluded,
}

impl JobStatus {
    /// Returns true for the terminal status.
    #[must_use]
    pub const fn is_concluded(self) -> bool {
        matches!(self, Self::Concluded)
    }
}

/// One entry from `query-jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    /// Caller-assigned job id.
    pub id: String,
    /// Current status.
    pub status: JobStatus,
}

/// One entry from `query-named-block-nodes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockNodeInfo {
    /// Unique node name inside the block graph.
    pub node_name: String,
    /// Driver of the node (protocol or format layer).
    pub drv: String,
    /// On-disk path backing the node, when the driver has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Backing file path, for format nodes chained onto a base image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_file: Option<String>,
}

/// Dirty-bitmap state as the engine sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapState {
    /// The bitmap is recording writes.
    Active,
    /// The bitmap is frozen; safe to merge or read.
    Disabled,
}

/// One dirty bitmap from a `query-block` device entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitmapInfo {
    /// Bitmap name, unique per node.
    pub name: String,
    /// Count of dirty bytes tracked by the bitmap.
    pub count: u64,
    /// Tracking granularity in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<u64>,
    /// Whether the bitmap is currently recording writes.
    pub recording: bool,
    /// Whether the bitmap survives monitor restarts.
    #[serde(default)]
    pub persistent: bool,
}

impl BitmapInfo {
    /// Returns the bitmap's state in the engine's two-state model.
    #[must_use]
    pub const fn state(&self) -> BitmapState {
        if self.recording {
            BitmapState::Active
        } else {
            BitmapState::Disabled
        }
    }
}

/// One entry from `query-block`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockDeviceInfo {
    /// Device (node) name.
    pub device: String,
    /// Bitmaps attached to the device.
    #[serde(default)]
    pub dirty_bitmaps: Vec<BitmapInfo>,
}

/// Tri-state persistence request for bitmap creation.
///
/// `Default` omits the field from the wire request, leaving the choice to
/// the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    On,
    Off,
    Default,
}

impl Persistence {
    /// Wire representation: `None` means "leave the field out".
    #[must_use]
    pub const fn as_flag(self) -> Option<bool> {
        match self {
            Self::On => Some(true),
            Self::Off => Some(false),
            Self::Default => None,
        }
    }
}

/// Backup synchronization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Copy every allocated region.
    Full,
    /// Copy only the regions a dirty bitmap marks.
    Incremental,
}

/// Request body for `blockdev-backup`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackupRequest {
    /// Caller-assigned id for the resulting job.
    pub job_id: String,
    /// Source device (node name).
    pub device: String,
    /// Target node name; must already exist in the graph.
    pub target: String,
    /// Synchronization mode.
    pub sync: SyncMode,
    /// Change-set bitmap, required for incremental sync.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitmap: Option<String>,
}

/// Driver-specific options for `blockdev-create`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum CreateOptions {
    /// Allocate a raw file on the host.
    #[serde(rename_all = "kebab-case")]
    File {
        filename: String,
        size: u64,
    },
    /// Format an existing protocol node as qcow2.
    #[serde(rename_all = "kebab-case")]
    Qcow2 {
        /// Protocol-layer node holding the raw storage.
        file: String,
        size: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        backing_file: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        backing_fmt: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cluster_size: Option<u64>,
    },
}

/// Request body for `blockdev-create`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockdevCreateRequest {
    /// Caller-assigned id for the creation job.
    pub job_id: String,
    /// Driver-specific creation options.
    pub options: CreateOptions,
}

/// Driver-specific options for `blockdev-add`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum AddOptions {
    /// Protocol-layer node over a host file.
    #[serde(rename_all = "kebab-case")]
    File {
        node_name: String,
        filename: String,
    },
    /// Format-layer node over a protocol node.
    #[serde(rename_all = "kebab-case")]
    Qcow2 {
        node_name: String,
        /// Protocol-layer node name.
        file: String,
        /// Backing node name, when chaining onto a previous target.
        #[serde(skip_serializing_if = "Option::is_none")]
        backing: Option<String>,
    },
}

impl AddOptions {
    /// The node name this request will register.
    #[must_use]
    pub fn node_name(&self) -> &str {
        match self {
            Self::File { node_name, .. } | Self::Qcow2 { node_name, .. } => node_name,
        }
    }
}

/// Request body for `block-dirty-bitmap-add`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BitmapAddRequest {
    pub node: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
}

/// Serializes a request body, surfacing serializer failures as protocol
/// errors.
pub fn to_arguments<T: Serialize>(req: &T) -> Result<Value> {
    serde_json::to_value(req).map_err(|e| MonitorError::protocol(e.to_string()))
}

fn parse<T: DeserializeOwned>(verb: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| MonitorError::protocol(format!("bad '{verb}' response: {e}")))
}

/// Returns the set of verbs the monitor advertises.
pub async fn query_commands(monitor: &dyn Monitor) -> Result<Vec<String>> {
    #[derive(Deserialize)]
    struct CommandInfo {
        name: String,
    }
    let value = monitor.send("query-commands", Value::Null).await?;
    let infos: Vec<CommandInfo> = parse("query-commands", value)?;
    Ok(infos.into_iter().map(|c| c.name).collect())
}

/// Returns all named nodes in the block graph.
pub async fn query_named_block_nodes(monitor: &dyn Monitor) -> Result<Vec<BlockNodeInfo>> {
    let value = monitor.send("query-named-block-nodes", Value::Null).await?;
    parse("query-named-block-nodes", value)
}

/// Looks up a single block node by name.
pub async fn find_block_node(
    monitor: &dyn Monitor,
    node_name: &str,
) -> Result<Option<BlockNodeInfo>> {
    let nodes = query_named_block_nodes(monitor).await?;
    Ok(nodes.into_iter().find(|n| n.node_name == node_name))
}

/// Returns the per-device view, including attached dirty bitmaps.
pub async fn query_block(monitor: &dyn Monitor) -> Result<Vec<BlockDeviceInfo>> {
    let value = monitor.send("query-block", Value::Null).await?;
    parse("query-block", value)
}

/// Returns all jobs known to the monitor.
pub async fn query_jobs(monitor: &dyn Monitor) -> Result<Vec<JobInfo>> {
    let value = monitor.send("query-jobs", Value::Null).await?;
    parse("query-jobs", value)
}

/// Acknowledges a concluded job, removing it from the job list.
pub async fn job_dismiss(monitor: &dyn Monitor, job_id: &str) -> Result<()> {
    let args = serde_json::json!({ "id": job_id });
    monitor.send("job-dismiss", args).await?;
    Ok(())
}

/// Starts an asynchronous storage-creation job.
pub async fn blockdev_create(monitor: &dyn Monitor, req: &BlockdevCreateRequest) -> Result<()> {
    monitor.send("blockdev-create", to_arguments(req)?).await?;
    Ok(())
}

/// Inserts a node into the block graph.
pub async fn blockdev_add(monitor: &dyn Monitor, options: &AddOptions) -> Result<()> {
    monitor.send("blockdev-add", to_arguments(options)?).await?;
    Ok(())
}

/// Starts an asynchronous backup job.
pub async fn blockdev_backup(monitor: &dyn Monitor, req: &BackupRequest) -> Result<()> {
    monitor.send("blockdev-backup", to_arguments(req)?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_request_wire_shape() {
        let req = BackupRequest {
            job_id: "j1".to_string(),
            device: "d0".to_string(),
            target: "t0".to_string(),
            sync: SyncMode::Incremental,
            bitmap: Some("b1".to_string()),
        };
        let value = to_arguments(&req).unwrap();
        assert_eq!(value["job-id"], "j1");
        assert_eq!(value["sync"], "incremental");
        assert_eq!(value["bitmap"], "b1");
    }

    #[test]
    fn test_backup_request_omits_absent_bitmap() {
        let req = BackupRequest {
            job_id: "j1".to_string(),
            device: "d0".to_string(),
            target: "t0".to_string(),
            sync: SyncMode::Full,
            bitmap: None,
        };
        let value = to_arguments(&req).unwrap();
        assert!(value.get("bitmap").is_none());
        assert_eq!(value["sync"], "full");
    }

    #[test]
    fn test_create_options_tagged_by_driver() {
        let opts = CreateOptions::Qcow2 {
            file: "proto0".to_string(),
            size: 1 << 30,
            backing_file: Some("/imgs/base.qcow2".to_string()),
            backing_fmt: Some("qcow2".to_string()),
            cluster_size: None,
        };
        let value = to_arguments(&opts).unwrap();
        assert_eq!(value["driver"], "qcow2");
        assert_eq!(value["backing-file"], "/imgs/base.qcow2");
        assert!(value.get("cluster-size").is_none());
    }

    #[test]
    fn test_job_status_wire_names() {
        let status: JobStatus = serde_json::from_value(serde_json::json!("waiting")).unwrap();
        assert_eq!(status, JobStatus::WaitingForInput);
        let status: JobStatus = serde_json::from_value(serde_json::json!("concluded")).unwrap();
        assert!(status.is_concluded());
    }

    #[test]
    fn test_bitmap_state_follows_recording_flag() {
        let info = BitmapInfo {
            name: "b1".to_string(),
            count: 0,
            granularity: Some(65536),
            recording: false,
            persistent: false,
        };
        assert_eq!(info.state(), BitmapState::Disabled);
    }

    #[test]
    fn test_persistence_tri_state() {
        assert_eq!(Persistence::On.as_flag(), Some(true));
        assert_eq!(Persistence::Off.as_flag(), Some(false));
        assert_eq!(Persistence::Default.as_flag(), None);
    }
}
