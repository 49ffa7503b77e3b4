//! Asynchronous job tracking.
//!
//! Creation and backup commands return immediately and leave a job behind;
//! its completion is observed by polling `query-jobs`. A concluded job stays
//! in the job list until explicitly dismissed, and its id cannot be reused
//! until then.

use crate::error::{BackupError, Result};
use blockback_monitor::qmp::{self, JobInfo, JobStatus};
use blockback_monitor::Monitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Polls jobs to their terminal state and dismisses them.
#[derive(Clone)]
pub struct JobTracker {
    monitor: Arc<dyn Monitor>,
    poll_interval: Duration,
}

impl JobTracker {
    /// Creates a tracker polling at the given interval.
    #[must_use]
    pub fn new(monitor: Arc<dyn Monitor>, poll_interval: Duration) -> Self {
        Self {
            monitor,
            poll_interval,
        }
    }

    /// Returns all jobs known to the monitor.
    pub async fn list(&self) -> Result<Vec<JobInfo>> {
        Ok(qmp::query_jobs(self.monitor.as_ref()).await?)
    }

    /// Looks up one job by id.
    ///
    /// A missing job is not an error here; callers that require the job log
    /// and fail on their own terms.
    pub async fn find(&self, job_id: &str) -> Result<Option<JobInfo>> {
        let jobs = self.list().await?;
        let found = jobs.into_iter().find(|j| j.id == job_id);
        if found.is_none() {
            tracing::warn!(job_id, "job not found in job list");
        }
        Ok(found)
    }

    /// Waits for a job to reach `target` status, polling within `timeout`.
    ///
    /// Fails with a timeout if the status is not observed in time, and with
    /// not-found if the job disappears from the job list first.
    pub async fn await_status(
        &self,
        job_id: &str,
        target: JobStatus,
        timeout: Duration,
    ) -> Result<JobInfo> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.find(job_id).await? {
                Some(job) if job.status == target => {
                    tracing::debug!(job_id, ?target, "job reached awaited status");
                    return Ok(job);
                }
                Some(job) => {
                    tracing::trace!(job_id, status = ?job.status, "job still in flight");
                }
                None => {
                    return Err(BackupError::not_found(format!(
                        "job '{job_id}' disappeared while awaiting {target:?}"
                    )));
                }
            }
            if Instant::now() >= deadline {
                return Err(BackupError::timeout(format!(
                    "job '{job_id}' did not reach {target:?} within {timeout:?}"
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Waits for a job to conclude.
    pub async fn await_concluded(&self, job_id: &str, timeout: Duration) -> Result<JobInfo> {
        self.await_status(job_id, JobStatus::Concluded, timeout).await
    }

    /// Dismisses a concluded job.
    ///
    /// Fails with invalid-state if the job has not concluded; a running job
    /// is never force-dismissed.
    pub async fn dismiss(&self, job_id: &str) -> Result<()> {
        let job = self
            .find(job_id)
            .await?
            .ok_or_else(|| BackupError::not_found(format!("job '{job_id}'")))?;
        if !job.status.is_concluded() {
            return Err(BackupError::invalid_state(format!(
                "job '{job_id}' is {:?}, not concluded",
                job.status
            )));
        }
        qmp::job_dismiss(self.monitor.as_ref(), job_id).await?;
        tracing::debug!(job_id, "job dismissed");
        Ok(())
    }

    /// Waits for conclusion, then dismisses. The common pattern after every
    /// creation job.
    pub async fn await_concluded_and_dismiss(&self, job_id: &str, timeout: Duration) -> Result<()> {
        self.await_concluded(job_id, timeout).await?;
        self.dismiss(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockback_monitor::testing::FakeMonitor;
    use serde_json::json;

    const POLL: Duration = Duration::from_millis(10);
    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn start_backup_job(fake: &FakeMonitor, job_id: &str) {
        fake.insert_device("d0");
        fake.insert_device("t0");
        fake.send(
            "blockdev-backup",
            json!({ "job-id": job_id, "device": "d0", "target": "t0", "sync": "full" }),
        )
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_concluded_observes_terminal_state() {
        let fake = Arc::new(FakeMonitor::new());
        start_backup_job(&fake, "j1").await;
        let tracker = JobTracker::new(fake, POLL);
        let job = tracker.await_concluded("j1", TIMEOUT).await.unwrap();
        assert!(job.status.is_concluded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_status_times_out() {
        let fake = Arc::new(FakeMonitor::new());
        start_backup_job(&fake, "j1").await;
        let tracker = JobTracker::new(fake, POLL);
        // The job concludes and never pauses, so this must hit the budget.
        let err = tracker
            .await_status("j1", JobStatus::Paused, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_status_on_missing_job_is_not_found() {
        let fake = Arc::new(FakeMonitor::new());
        let tracker = JobTracker::new(fake, POLL);
        let err = tracker.await_concluded("absent", TIMEOUT).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismiss_rejects_running_job() {
        let fake = Arc::new(FakeMonitor::new());
        start_backup_job(&fake, "j1").await;
        let tracker = JobTracker::new(fake, POLL);
        let err = tracker.dismiss("j1").await.unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismiss_is_not_idempotent() {
        let fake = Arc::new(FakeMonitor::new());
        start_backup_job(&fake, "j1").await;
        let tracker = JobTracker::new(Arc::clone(&fake) as Arc<dyn Monitor>, POLL);
        tracker
            .await_concluded_and_dismiss("j1", TIMEOUT)
            .await
            .unwrap();
        assert!(!fake.job_exists("j1"));
        // A second dismiss must fail, never silently succeed.
        let err = tracker.dismiss("j1").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
