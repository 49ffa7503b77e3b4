//! Storage provisioning seam.
//!
//! The engine does not manage image pools; it only needs somewhere to put
//! target image files and a way to clean them up. The provisioner owns
//! naming and host-side lifecycle, while the image content itself is written
//! by the block layer through `blockdev-create`.

use crate::error::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Creates and destroys backing image files for backup targets.
#[async_trait]
pub trait StorageProvisioner: Send + Sync {
    /// Allocates an image file for a new target and returns its path.
    ///
    /// Fails with already-exists if an image with that name is present.
    async fn create_image(&self, name: &str, size: u64) -> Result<PathBuf>;

    /// Removes an image file.
    ///
    /// Fails with not-found if the image does not exist; destruction is not
    /// idempotent.
    async fn destroy_image(&self, path: &Path) -> Result<()>;
}

/// Provisions image files under a flat data directory.
pub struct LocalDirProvisioner {
    data_dir: PathBuf,
}

impl LocalDirProvisioner {
    /// Creates a provisioner rooted at `data_dir`.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }
}

#[async_trait]
impl StorageProvisioner for LocalDirProvisioner {
    async fn create_image(&self, name: &str, size: u64) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let path = self.data_dir.join(format!("{name}.qcow2"));
        if tokio::fs::try_exists(&path).await? {
            return Err(BackupError::already_exists(format!(
                "image '{}'",
                path.display()
            )));
        }
        let file = tokio::fs::File::create(&path).await?;
        file.set_len(size).await?;
        tracing::debug!(path = %path.display(), size, "image file provisioned");
        Ok(path)
    }

    async fn destroy_image(&self, path: &Path) -> Result<()> {
        if !tokio::fs::try_exists(path).await? {
            return Err(BackupError::not_found(format!(
                "image '{}'",
                path.display()
            )));
        }
        tokio::fs::remove_file(path).await?;
        tracing::debug!(path = %path.display(), "image file destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_destroy_image() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = LocalDirProvisioner::new(dir.path());
        let path = provisioner.create_image("t0", 4096).await.unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
        provisioner.destroy_image(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_create_duplicate_image_fails() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = LocalDirProvisioner::new(dir.path());
        provisioner.create_image("t0", 4096).await.unwrap();
        let err = provisioner.create_image("t0", 4096).await.unwrap_err();
        assert!(matches!(
            err,
            BackupError::Common(e) if e.is_already_exists()
        ));
    }

    #[tokio::test]
    async fn test_destroy_missing_image_fails() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = LocalDirProvisioner::new(dir.path());
        let err = provisioner
            .destroy_image(&dir.path().join("ghost.qcow2"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
