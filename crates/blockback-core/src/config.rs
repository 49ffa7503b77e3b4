//! Engine configuration.
//!
//! Configuration is loaded from multiple sources with the following
//! priority:
//!
//! 1. Environment variables (`BLOCKBACK_*`, nested keys joined with `__`)
//! 2. Configuration file (`blockback.toml` in the working directory)
//! 3. Default values
//!
//! ## Example Configuration File
//!
//! ```toml
//! data_dir = "/var/lib/blockback"
//!
//! [job]
//! poll_interval_ms = 100
//! timeout_secs = 30
//!
//! [bitmap]
//! clear_settle_ms = 300
//!
//! [image]
//! format = "qcow2"
//! cluster_size = 65536
//! ```

use blockback_error::CommonError;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Directory where target image files are provisioned.
    pub data_dir: PathBuf,
    /// Job polling behavior.
    pub job: JobConfig,
    /// Bitmap post-condition behavior.
    pub bitmap: BitmapConfig,
    /// Target image defaults.
    pub image: ImageConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/blockback"),
            job: JobConfig::default(),
            bitmap: BitmapConfig::default(),
            image: ImageConfig::default(),
        }
    }
}

/// Job polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Delay between `query-jobs` polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Bounded wait for a job to reach the awaited status, in seconds.
    pub timeout_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            timeout_secs: 30,
        }
    }
}

/// Bitmap configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BitmapConfig {
    /// Settle delay between issuing a clear and asserting the record count
    /// reached zero, in milliseconds.
    pub clear_settle_ms: u64,
}

impl Default for BitmapConfig {
    fn default() -> Self {
        Self { clear_settle_ms: 300 }
    }
}

/// Target image configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Format-layer driver for backup targets.
    pub format: String,
    /// Cluster size passed to format-layer creation, when set.
    pub cluster_size: Option<u64>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            format: "qcow2".to_string(),
            cluster_size: None,
        }
    }
}

impl BackupConfig {
    /// Loads configuration from defaults, `blockback.toml`, and the
    /// environment.
    pub fn load() -> Result<Self, CommonError> {
        Self::load_from("blockback.toml")
    }

    /// Loads configuration with an explicit config-file path.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, CommonError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BLOCKBACK_").split("__"))
            .extract()
            .map_err(|e| CommonError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), CommonError> {
        if self.job.poll_interval_ms == 0 {
            return Err(CommonError::config("job.poll_interval_ms must be nonzero"));
        }
        if self.job.timeout_secs == 0 {
            return Err(CommonError::config("job.timeout_secs must be nonzero"));
        }
        if let Some(cluster_size) = self.image.cluster_size {
            if !cluster_size.is_power_of_two() {
                return Err(CommonError::config(
                    "image.cluster_size must be a power of two",
                ));
            }
        }
        Ok(())
    }

    /// Delay between job polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.job.poll_interval_ms)
    }

    /// Bounded wait for job status changes.
    #[must_use]
    pub const fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job.timeout_secs)
    }

    /// Settle delay after a bitmap clear.
    #[must_use]
    pub const fn clear_settle(&self) -> Duration {
        Duration::from_millis(self.bitmap.clear_settle_ms)
    }
}
