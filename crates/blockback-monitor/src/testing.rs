//! In-memory monitor double for tests.
//!
//! [`FakeMonitor`] models the slice of block-layer state this engine talks
//! to: named nodes, dirty bitmaps (as sets of dirty granules), asynchronous
//! jobs that conclude after a few polls, and atomic transactions. Tests seed
//! a source device, mark guest writes with [`FakeMonitor::write`], and drive
//! the engine through the ordinary [`Monitor`] seam.

use crate::error::{MonitorError, Result};
use crate::qmp::JobStatus;
use crate::Monitor;
use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

/// Bitmap granularity modeled by the fake, in bytes.
pub const GRANULARITY: u64 = 65536;

/// Polls a creation job stays non-terminal before concluding.
const CREATE_JOB_POLLS: u32 = 1;
/// Polls a backup job stays non-terminal before concluding.
const BACKUP_JOB_POLLS: u32 = 2;

const STABLE_COMMANDS: &[&str] = &[
    "query-commands",
    "blockdev-create",
    "blockdev-add",
    "blockdev-backup",
    "block-dirty-bitmap-add",
    "block-dirty-bitmap-disable",
    "block-dirty-bitmap-clear",
    "block-dirty-bitmap-remove",
    "block-dirty-bitmap-merge",
    "query-named-block-nodes",
    "query-block",
    "query-jobs",
    "job-dismiss",
    "transaction",
    "debug-block-dirty-bitmap-sha256",
];

#[derive(Debug, Clone)]
struct NodeRec {
    driver: String,
    filename: Option<String>,
    backing: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct BitmapRec {
    /// Dirty granule indexes. Count and sha256 derive from this set only,
    /// so a merged bitmap digests identically to a single bitmap that
    /// tracked the same writes.
    regions: BTreeSet<u64>,
    recording: bool,
    persistent: bool,
}

#[derive(Debug, Clone)]
struct JobRec {
    status: JobStatus,
    remaining_polls: u32,
}

#[derive(Debug, Clone, Default)]
struct FakeState {
    commands: HashSet<String>,
    nodes: BTreeMap<String, NodeRec>,
    bitmaps: BTreeMap<String, BTreeMap<String, BitmapRec>>,
    jobs: BTreeMap<String, JobRec>,
    /// Filenames allocated by `blockdev-create` with the file driver.
    files: HashSet<String>,
    /// Bitmaps that ignore clear and remove, for post-condition tests.
    sticky: HashSet<(String, String)>,
}

/// In-memory [`Monitor`] implementation.
pub struct FakeMonitor {
    state: Mutex<FakeState>,
    sent: Mutex<HashMap<String, usize>>,
}

impl Default for FakeMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMonitor {
    /// A monitor advertising the full stable command set.
    #[must_use]
    pub fn new() -> Self {
        let state = FakeState {
            commands: STABLE_COMMANDS.iter().map(ToString::to_string).collect(),
            ..FakeState::default()
        };
        Self {
            state: Mutex::new(state),
            sent: Mutex::new(HashMap::new()),
        }
    }

    /// A monitor whose bitmap merge and disable commands only exist under
    /// the experimental spelling.
    #[must_use]
    pub fn with_experimental_bitmaps() -> Self {
        let fake = Self::new();
        {
            let mut state = fake.state.lock().expect("fake state lock");
            for verb in ["block-dirty-bitmap-merge", "block-dirty-bitmap-disable"] {
                state.commands.remove(verb);
                state.commands.insert(format!("x-{verb}"));
            }
        }
        fake
    }

    /// A monitor that does not advertise `verb` at all.
    #[must_use]
    pub fn without_command(verb: &str) -> Self {
        let fake = Self::new();
        fake.state
            .lock()
            .expect("fake state lock")
            .commands
            .remove(verb);
        fake
    }

    /// Seeds a source device node, as if a guest disk were already attached.
    pub fn insert_device(&self, node: &str) {
        let mut state = self.state.lock().expect("fake state lock");
        state.nodes.insert(
            node.to_string(),
            NodeRec {
                driver: "qcow2".to_string(),
                filename: None,
                backing: None,
            },
        );
        state.bitmaps.entry(node.to_string()).or_default();
    }

    /// Marks guest writes: every recording bitmap on the node picks up the
    /// given dirty granules.
    pub fn write(&self, node: &str, granules: &[u64]) {
        let mut state = self.state.lock().expect("fake state lock");
        let Some(bitmaps) = state.bitmaps.get_mut(node) else {
            return;
        };
        for rec in bitmaps.values_mut() {
            if rec.recording {
                rec.regions.extend(granules.iter().copied());
            }
        }
    }

    /// Makes a bitmap resist clear and remove, to exercise the engine's
    /// post-condition checks.
    pub fn make_sticky(&self, node: &str, name: &str) {
        self.state
            .lock()
            .expect("fake state lock")
            .sticky
            .insert((node.to_string(), name.to_string()));
    }

    /// Number of times `verb` has been sent.
    #[must_use]
    pub fn sent_count(&self, verb: &str) -> usize {
        self.sent
            .lock()
            .expect("fake sent lock")
            .get(verb)
            .copied()
            .unwrap_or(0)
    }

    /// Whether a node with this name exists in the graph.
    #[must_use]
    pub fn node_exists(&self, node: &str) -> bool {
        self.state
            .lock()
            .expect("fake state lock")
            .nodes
            .contains_key(node)
    }

    /// Whether a job with this id is still in the job list.
    #[must_use]
    pub fn job_exists(&self, job_id: &str) -> bool {
        self.state
            .lock()
            .expect("fake state lock")
            .jobs
            .contains_key(job_id)
    }

    /// Dirty-byte count of a bitmap, or `None` if it does not exist.
    #[must_use]
    pub fn dirty_count(&self, node: &str, name: &str) -> Option<u64> {
        let state = self.state.lock().expect("fake state lock");
        let rec = state.bitmaps.get(node)?.get(name)?;
        Some(rec.regions.len() as u64 * GRANULARITY)
    }
}

#[async_trait]
impl Monitor for FakeMonitor {
    async fn send(&self, verb: &str, arguments: Value) -> Result<Value> {
        {
            let mut sent = self
                .sent
                .lock()
                .map_err(|_| MonitorError::protocol("fake sent lock poisoned"))?;
            *sent.entry(verb.to_string()).or_insert(0) += 1;
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| MonitorError::protocol("fake state lock poisoned"))?;
        if !state.commands.contains(verb) {
            return Err(MonitorError::command_failed(
                verb,
                format!("The command {verb} has not been found"),
            ));
        }
        apply_command(&mut state, verb, &arguments)
    }
}

fn fail(verb: &str, desc: impl Into<String>) -> MonitorError {
    MonitorError::command_failed(verb, desc)
}

fn require_str<'a>(verb: &str, args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| fail(verb, format!("missing argument '{key}'")))
}

fn require_u64(verb: &str, args: &Value, key: &str) -> Result<u64> {
    args.get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| fail(verb, format!("missing argument '{key}'")))
}

fn bitmap_rec<'a>(
    verb: &str,
    state: &'a mut FakeState,
    node: &str,
    name: &str,
) -> Result<&'a mut BitmapRec> {
    state
        .bitmaps
        .get_mut(node)
        .and_then(|m| m.get_mut(name))
        .ok_or_else(|| fail(verb, format!("bitmap '{name}' not found on node '{node}'")))
}

#[allow(clippy::too_many_lines)]
fn apply_command(state: &mut FakeState, verb: &str, args: &Value) -> Result<Value> {
    match verb {
        "query-commands" => {
            let mut names: Vec<&String> = state.commands.iter().collect();
            names.sort();
            Ok(json!(names
                .into_iter()
                .map(|n| json!({ "name": n }))
                .collect::<Vec<_>>()))
        }

        "query-named-block-nodes" => {
            let nodes: Vec<Value> = state
                .nodes
                .iter()
                .map(|(name, rec)| {
                    json!({
                        "node-name": name,
                        "drv": rec.driver,
                        "file": rec.filename,
                        "backing-file": rec.backing.as_ref()
                            .and_then(|b| state.nodes.get(b))
                            .and_then(|b| b.filename.clone()),
                    })
                })
                .collect();
            Ok(json!(nodes))
        }

        "query-block" => {
            let devices: Vec<Value> = state
                .bitmaps
                .iter()
                .map(|(node, bitmaps)| {
                    let infos: Vec<Value> = bitmaps
                        .iter()
                        .map(|(name, rec)| {
                            json!({
                                "name": name,
                                "count": rec.regions.len() as u64 * GRANULARITY,
                                "granularity": GRANULARITY,
                                "recording": rec.recording,
                                "persistent": rec.persistent,
                            })
                        })
                        .collect();
                    json!({ "device": node, "dirty-bitmaps": infos })
                })
                .collect();
            Ok(json!(devices))
        }

        "query-jobs" => {
            for rec in state.jobs.values_mut() {
                if rec.status == JobStatus::Running {
                    if rec.remaining_polls > 0 {
                        rec.remaining_polls -= 1;
                    }
                    if rec.remaining_polls == 0 {
                        rec.status = JobStatus::Concluded;
                    }
                }
            }
            let jobs: Vec<Value> = state
                .jobs
                .iter()
                .map(|(id, rec)| json!({ "id": id, "status": rec.status }))
                .collect();
            Ok(json!(jobs))
        }

        "job-dismiss" => {
            let id = require_str(verb, args, "id")?;
            let rec = state
                .jobs
                .get(id)
                .ok_or_else(|| fail(verb, format!("job '{id}' not found")))?;
            if rec.status != JobStatus::Concluded {
                return Err(fail(verb, format!("job '{id}' is not concluded")));
            }
            state.jobs.remove(id);
            Ok(Value::Null)
        }

        "blockdev-create" => {
            let job_id = require_str(verb, args, "job-id")?.to_string();
            if state.jobs.contains_key(&job_id) {
                return Err(fail(verb, format!("duplicate job id '{job_id}'")));
            }
            let options = args
                .get("options")
                .ok_or_else(|| fail(verb, "missing argument 'options'"))?;
            match require_str(verb, options, "driver")? {
                "file" => {
                    let filename = require_str(verb, options, "filename")?.to_string();
                    require_u64(verb, options, "size")?;
                    state.files.insert(filename);
                }
                "qcow2" => {
                    let file = require_str(verb, options, "file")?;
                    require_u64(verb, options, "size")?;
                    if !state.nodes.contains_key(file) {
                        return Err(fail(verb, format!("node '{file}' not found")));
                    }
                    if let Some(backing) = options.get("backing-file").and_then(Value::as_str) {
                        if !state.files.contains(backing) {
                            return Err(fail(verb, format!("backing file '{backing}' not found")));
                        }
                    }
                }
                other => return Err(fail(verb, format!("unknown driver '{other}'"))),
            }
            state.jobs.insert(
                job_id,
                JobRec {
                    status: JobStatus::Running,
                    remaining_polls: CREATE_JOB_POLLS,
                },
            );
            Ok(Value::Null)
        }

        "blockdev-add" => {
            let node_name = require_str(verb, args, "node-name")?.to_string();
            if state.nodes.contains_key(&node_name) {
                return Err(fail(verb, format!("duplicate node name '{node_name}'")));
            }
            let rec = match require_str(verb, args, "driver")? {
                "file" => {
                    let filename = require_str(verb, args, "filename")?.to_string();
                    if !state.files.contains(&filename) {
                        return Err(fail(verb, format!("no such file '{filename}'")));
                    }
                    NodeRec {
                        driver: "file".to_string(),
                        filename: Some(filename),
                        backing: None,
                    }
                }
                "qcow2" => {
                    let file = require_str(verb, args, "file")?.to_string();
                    let filename = state
                        .nodes
                        .get(&file)
                        .ok_or_else(|| fail(verb, format!("node '{file}' not found")))?
                        .filename
                        .clone();
                    let backing = args.get("backing").and_then(Value::as_str);
                    if let Some(backing) = backing {
                        if !state.nodes.contains_key(backing) {
                            return Err(fail(verb, format!("backing node '{backing}' not found")));
                        }
                    }
                    NodeRec {
                        driver: "qcow2".to_string(),
                        filename,
                        backing: backing.map(ToString::to_string),
                    }
                }
                other => return Err(fail(verb, format!("unknown driver '{other}'"))),
            };
            state.nodes.insert(node_name.clone(), rec);
            state.bitmaps.entry(node_name).or_default();
            Ok(Value::Null)
        }

        "blockdev-backup" => {
            let job_id = require_str(verb, args, "job-id")?.to_string();
            if state.jobs.contains_key(&job_id) {
                return Err(fail(verb, format!("duplicate job id '{job_id}'")));
            }
            let device = require_str(verb, args, "device")?;
            let target = require_str(verb, args, "target")?;
            if !state.nodes.contains_key(device) {
                return Err(fail(verb, format!("device '{device}' not found")));
            }
            if !state.nodes.contains_key(target) {
                return Err(fail(verb, format!("target '{target}' not found")));
            }
            match require_str(verb, args, "sync")? {
                "full" => {}
                "incremental" => {
                    let bitmap = require_str(verb, args, "bitmap")?;
                    bitmap_rec(verb, state, device, bitmap)?;
                }
                other => return Err(fail(verb, format!("unknown sync mode '{other}'"))),
            }
            state.jobs.insert(
                job_id,
                JobRec {
                    status: JobStatus::Running,
                    remaining_polls: BACKUP_JOB_POLLS,
                },
            );
            Ok(Value::Null)
        }

        "block-dirty-bitmap-add" | "x-block-dirty-bitmap-add" => {
            let node = require_str(verb, args, "node")?.to_string();
            let name = require_str(verb, args, "name")?.to_string();
            if !state.nodes.contains_key(&node) {
                return Err(fail(verb, format!("node '{node}' not found")));
            }
            let bitmaps = state.bitmaps.entry(node.clone()).or_default();
            if bitmaps.contains_key(&name) {
                return Err(fail(
                    verb,
                    format!("bitmap '{name}' already exists on node '{node}'"),
                ));
            }
            let disabled = args
                .get("disabled")
                .or_else(|| args.get("x-disabled"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let persistent = args
                .get("persistent")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            bitmaps.insert(
                name,
                BitmapRec {
                    regions: BTreeSet::new(),
                    recording: !disabled,
                    persistent,
                },
            );
            Ok(Value::Null)
        }

        "block-dirty-bitmap-disable" | "x-block-dirty-bitmap-disable" => {
            let node = require_str(verb, args, "node")?;
            let name = require_str(verb, args, "name")?;
            bitmap_rec(verb, state, node, name)?.recording = false;
            Ok(Value::Null)
        }

        "block-dirty-bitmap-clear" => {
            let node = require_str(verb, args, "node")?;
            let name = require_str(verb, args, "name")?;
            let sticky = state.sticky.contains(&(node.to_string(), name.to_string()));
            let rec = bitmap_rec(verb, state, node, name)?;
            if !sticky {
                rec.regions.clear();
            }
            Ok(Value::Null)
        }

        "block-dirty-bitmap-remove" => {
            let node = require_str(verb, args, "node")?;
            let name = require_str(verb, args, "name")?;
            bitmap_rec(verb, state, node, name)?;
            if !state.sticky.contains(&(node.to_string(), name.to_string())) {
                state
                    .bitmaps
                    .get_mut(node)
                    .and_then(|m| m.remove(name))
                    .ok_or_else(|| fail(verb, format!("bitmap '{name}' not found")))?;
            }
            Ok(Value::Null)
        }

        "block-dirty-bitmap-merge" => {
            let node = require_str(verb, args, "node")?;
            let target = require_str(verb, args, "target")?;
            let sources: Vec<String> = args
                .get("bitmaps")
                .and_then(Value::as_array)
                .ok_or_else(|| fail(verb, "missing argument 'bitmaps'"))?
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect();
            let mut merged = BTreeSet::new();
            for source in &sources {
                merged.extend(bitmap_rec(verb, state, node, source)?.regions.iter().copied());
            }
            let rec = bitmap_rec(verb, state, node, target)?;
            rec.regions.extend(merged);
            Ok(Value::Null)
        }

        "x-block-dirty-bitmap-merge" => {
            let node = require_str(verb, args, "node")?;
            let source = require_str(verb, args, "src-name")?;
            let target = require_str(verb, args, "dst-name")?;
            let regions = bitmap_rec(verb, state, node, source)?.regions.clone();
            bitmap_rec(verb, state, node, target)?.regions.extend(regions);
            Ok(Value::Null)
        }

        "debug-block-dirty-bitmap-sha256" => {
            let node = require_str(verb, args, "node")?;
            let name = require_str(verb, args, "name")?;
            let rec = bitmap_rec(verb, state, node, name)?;
            // Digest depends only on the node and dirty-region content, so
            // merged bitmaps hash identically to an equivalent single bitmap.
            let mut hasher = Sha256::new();
            hasher.update(node.as_bytes());
            for granule in &rec.regions {
                hasher.update(granule.to_le_bytes());
            }
            let digest = hasher
                .finalize()
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>();
            Ok(json!({ "sha256": digest }))
        }

        "transaction" => {
            let actions = args
                .get("actions")
                .and_then(Value::as_array)
                .ok_or_else(|| fail(verb, "missing argument 'actions'"))?;
            // Apply against a scratch copy; commit only if every action
            // succeeds.
            let mut scratch = state.clone();
            for action in actions {
                let action_type = require_str(verb, action, "type")?;
                let data = action
                    .get("data")
                    .ok_or_else(|| fail(verb, "action without data"))?;
                apply_command(&mut scratch, action_type, data)?;
            }
            *state = scratch;
            Ok(Value::Null)
        }

        other => Err(fail(other, "not modeled by the fake monitor")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transaction_is_atomic() {
        let fake = FakeMonitor::new();
        fake.insert_device("d0");
        // Second action fails (duplicate name), so the first must not commit.
        let args = json!({
            "actions": [
                { "type": "block-dirty-bitmap-add", "data": { "node": "d0", "name": "b1" } },
                { "type": "block-dirty-bitmap-add", "data": { "node": "d0", "name": "b1" } },
            ]
        });
        let err = fake.send("transaction", args).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(fake.dirty_count("d0", "b1"), None);
    }

    #[tokio::test]
    async fn test_writes_reach_only_recording_bitmaps() {
        let fake = FakeMonitor::new();
        fake.insert_device("d0");
        for name in ["b1", "b2"] {
            fake.send(
                "block-dirty-bitmap-add",
                json!({ "node": "d0", "name": name }),
            )
            .await
            .unwrap();
        }
        fake.send(
            "block-dirty-bitmap-disable",
            json!({ "node": "d0", "name": "b2" }),
        )
        .await
        .unwrap();
        fake.write("d0", &[1, 2, 3]);
        assert_eq!(fake.dirty_count("d0", "b1"), Some(3 * GRANULARITY));
        assert_eq!(fake.dirty_count("d0", "b2"), Some(0));
    }

    #[tokio::test]
    async fn test_jobs_conclude_after_polling() {
        let fake = FakeMonitor::new();
        fake.insert_device("d0");
        fake.insert_device("t0");
        fake.send(
            "blockdev-backup",
            json!({ "job-id": "j1", "device": "d0", "target": "t0", "sync": "full" }),
        )
        .await
        .unwrap();

        let mut concluded = false;
        for _ in 0..4 {
            let jobs = fake.send("query-jobs", Value::Null).await.unwrap();
            if jobs[0]["status"] == "concluded" {
                concluded = true;
                break;
            }
        }
        assert!(concluded);
        fake.send("job-dismiss", json!({ "id": "j1" })).await.unwrap();
        assert!(!fake.job_exists("j1"));
    }

    #[tokio::test]
    async fn test_dismiss_requires_concluded_job() {
        let fake = FakeMonitor::new();
        fake.insert_device("d0");
        fake.insert_device("t0");
        fake.send(
            "blockdev-backup",
            json!({ "job-id": "j1", "device": "d0", "target": "t0", "sync": "full" }),
        )
        .await
        .unwrap();
        let err = fake
            .send("job-dismiss", json!({ "id": "j1" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not concluded"));
    }

    #[tokio::test]
    async fn test_unadvertised_command_is_rejected() {
        let fake = FakeMonitor::with_experimental_bitmaps();
        fake.insert_device("d0");
        let err = fake
            .send(
                "block-dirty-bitmap-disable",
                json!({ "node": "d0", "name": "b1" }),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("has not been found"));
    }
}
