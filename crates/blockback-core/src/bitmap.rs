//! Dirty-bitmap lifecycle.
//!
//! Bitmap commands are fire-and-forget: the monitor acknowledges the command
//! and nothing else. Correctness is therefore confirmed by re-querying state
//! after every mutation; a read-back that does not observe the expected
//! state surfaces as an invariant violation and is never retried.

use crate::error::{BackupError, Result};
use blockback_monitor::qmp::{self, BitmapInfo, BitmapState, Persistence};
use blockback_monitor::{CommandNegotiator, Monitor, Transaction, TransactionAction};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Query and mutate dirty-bitmap state on block nodes.
#[derive(Clone)]
pub struct BitmapRegistry {
    monitor: Arc<dyn Monitor>,
    negotiator: Arc<CommandNegotiator>,
    clear_settle: Duration,
}

impl BitmapRegistry {
    /// Creates a registry over one monitor session.
    #[must_use]
    pub fn new(
        monitor: Arc<dyn Monitor>,
        negotiator: Arc<CommandNegotiator>,
        clear_settle: Duration,
    ) -> Self {
        Self {
            monitor,
            negotiator,
            clear_settle,
        }
    }

    /// Returns every bitmap currently on the node.
    ///
    /// Always derived fresh from `query-block`; bitmap state is never
    /// cached.
    pub async fn query_all(&self, node: &str) -> Result<Vec<BitmapInfo>> {
        let devices = qmp::query_block(self.monitor.as_ref()).await?;
        devices
            .into_iter()
            .find(|d| d.device == node)
            .map(|d| d.dirty_bitmaps)
            .ok_or_else(|| BackupError::not_found(format!("device '{node}'")))
    }

    /// Looks up one bitmap by name.
    pub async fn query_by_name(&self, node: &str, name: &str) -> Result<Option<BitmapInfo>> {
        let bitmaps = self.query_all(node).await?;
        Ok(bitmaps.into_iter().find(|b| b.name == name))
    }

    /// Adds a bitmap to the node.
    ///
    /// Fails with already-exists if a bitmap with that name is present.
    pub async fn add(&self, node: &str, name: &str, persistence: Persistence) -> Result<()> {
        if self.query_by_name(node, name).await?.is_some() {
            return Err(BackupError::already_exists(format!(
                "bitmap '{name}' on node '{node}'"
            )));
        }
        let cmd = self
            .negotiator
            .resolve(self.monitor.as_ref(), "block-dirty-bitmap-add")
            .await?;
        let request = qmp::BitmapAddRequest {
            node: node.to_string(),
            name: name.to_string(),
            persistent: persistence.as_flag(),
        };
        self.monitor
            .send(&cmd.verb, qmp::to_arguments(&request)?)
            .await?;
        tracing::debug!(node, bitmap = name, "bitmap added");
        Ok(())
    }

    /// Disables a bitmap and verifies the state actually changed.
    pub async fn disable(&self, node: &str, name: &str) -> Result<()> {
        let cmd = self
            .negotiator
            .resolve(self.monitor.as_ref(), "block-dirty-bitmap-disable")
            .await?;
        self.monitor
            .send(&cmd.verb, json!({ "node": node, "name": name }))
            .await?;
        let info = self.query_by_name(node, name).await?.ok_or_else(|| {
            BackupError::invariant(format!(
                "bitmap '{name}' on node '{node}' vanished after disable"
            ))
        })?;
        if info.state() != BitmapState::Disabled {
            return Err(BackupError::invariant(format!(
                "bitmap '{name}' on node '{node}' still active after disable"
            )));
        }
        tracing::debug!(node, bitmap = name, "bitmap disabled");
        Ok(())
    }

    /// Merges source bitmaps into `target`.
    ///
    /// On the stable verb this is a single list-form call. When only the
    /// experimental pairwise verb exists, a single source is one call and
    /// multiple sources become one atomic transaction of pairwise merges
    /// into the same target.
    pub async fn merge(&self, node: &str, sources: &[&str], target: &str) -> Result<()> {
        if sources.is_empty() {
            return Err(BackupError::invalid_state(format!(
                "merge into '{target}' needs at least one source bitmap"
            )));
        }
        let cmd = self
            .negotiator
            .resolve(self.monitor.as_ref(), "block-dirty-bitmap-merge")
            .await?;
        tracing::debug!(node, ?sources, target, verb = %cmd.verb, "merging bitmaps");
        if !cmd.is_experimental() {
            self.monitor
                .send(
                    &cmd.verb,
                    json!({ "node": node, "bitmaps": sources, "target": target }),
                )
                .await?;
        } else if let [source] = sources {
            self.monitor
                .send(
                    &cmd.verb,
                    json!({ "node": node, "src-name": source, "dst-name": target }),
                )
                .await?;
        } else {
            let mut transaction = Transaction::new();
            for source in sources {
                let data = json!({ "node": node, "src-name": source, "dst-name": target });
                let data = data
                    .as_object()
                    .cloned()
                    .ok_or_else(|| BackupError::invariant("merge action must be an object"))?;
                transaction.push(TransactionAction::build(&cmd, data));
            }
            transaction.submit(self.monitor.as_ref()).await?;
        }
        self.query_by_name(node, target).await?.ok_or_else(|| {
            BackupError::invariant(format!(
                "target bitmap '{target}' on node '{node}' missing after merge"
            ))
        })?;
        Ok(())
    }

    /// Clears a bitmap and asserts its record count settled to zero.
    pub async fn clear(&self, node: &str, name: &str) -> Result<()> {
        self.query_by_name(node, name)
            .await?
            .ok_or_else(|| BackupError::not_found(format!("bitmap '{name}' on node '{node}'")))?;
        let cmd = self
            .negotiator
            .resolve(self.monitor.as_ref(), "block-dirty-bitmap-clear")
            .await?;
        self.monitor
            .send(&cmd.verb, json!({ "node": node, "name": name }))
            .await?;
        // The count is updated asynchronously; give it a bounded settle
        // window before asserting.
        tokio::time::sleep(self.clear_settle).await;
        let info = self.query_by_name(node, name).await?.ok_or_else(|| {
            BackupError::invariant(format!(
                "bitmap '{name}' on node '{node}' vanished after clear"
            ))
        })?;
        if info.count != 0 {
            return Err(BackupError::invariant(format!(
                "bitmap '{name}' on node '{node}' has count {} after clear",
                info.count
            )));
        }
        tracing::debug!(node, bitmap = name, "bitmap cleared");
        Ok(())
    }

    /// Removes a bitmap and asserts it is no longer queryable.
    pub async fn remove(&self, node: &str, name: &str) -> Result<()> {
        self.query_by_name(node, name)
            .await?
            .ok_or_else(|| BackupError::not_found(format!("bitmap '{name}' on node '{node}'")))?;
        let cmd = self
            .negotiator
            .resolve(self.monitor.as_ref(), "block-dirty-bitmap-remove")
            .await?;
        self.monitor
            .send(&cmd.verb, json!({ "node": node, "name": name }))
            .await?;
        if self.query_by_name(node, name).await?.is_some() {
            return Err(BackupError::invariant(format!(
                "bitmap '{name}' on node '{node}' still present after remove"
            )));
        }
        tracing::debug!(node, bitmap = name, "bitmap removed");
        Ok(())
    }

    /// Clears every bitmap on the node, in query order, failing fast.
    pub async fn clear_all(&self, node: &str) -> Result<()> {
        for info in self.query_all(node).await? {
            self.clear(node, &info.name).await?;
        }
        Ok(())
    }

    /// Removes every bitmap on the node, in query order, failing fast.
    pub async fn remove_all(&self, node: &str) -> Result<()> {
        for info in self.query_all(node).await? {
            self.remove(node, &info.name).await?;
        }
        Ok(())
    }

    /// Returns the bitmap's content digest.
    ///
    /// The bitmap should be disabled first so the digest is stable.
    pub async fn sha256(&self, node: &str, name: &str) -> Result<String> {
        let cmd = self
            .negotiator
            .resolve(self.monitor.as_ref(), "debug-block-dirty-bitmap-sha256")
            .await?;
        let response = self
            .monitor
            .send(&cmd.verb, json!({ "node": node, "name": name }))
            .await?;
        response
            .get("sha256")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| {
                BackupError::invariant(format!(
                    "sha256 response for bitmap '{name}' on node '{node}' missing digest"
                ))
            })
    }
}
