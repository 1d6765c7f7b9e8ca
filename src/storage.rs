//! Artifact storage seam
//!
//! The download queue persists fetched bytes through the [`ArtifactStorage`]
//! trait. The bundled [`FsArtifactStorage`] writes to the local filesystem;
//! environments without filesystem access can supply an implementation that
//! returns [`DownloadError::StorageUnavailable`] to route jobs onto the
//! manual-save fallback path.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::{DownloadError, Error, Result};

/// Opaque "save bytes at path" primitive used by the download queue
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Persist `bytes` at (or near) `dest`, returning the final path.
    ///
    /// Implementations may adjust the destination (e.g. to avoid
    /// collisions); callers must treat the returned path as authoritative.
    async fn save(&self, bytes: &[u8], dest: &Path) -> Result<PathBuf>;
}

/// Filesystem-backed artifact storage
///
/// Creates parent directories on demand. On filename collision the
/// destination is uniquified with a ` (1)`, ` (2)`, ... suffix instead of
/// overwriting the existing file.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsArtifactStorage;

impl FsArtifactStorage {
    /// Create a new filesystem storage
    pub fn new() -> Self {
        Self
    }

    /// Pick a destination that does not collide with an existing file.
    fn uniquify(dest: &Path) -> PathBuf {
        if !dest.exists() {
            return dest.to_path_buf();
        }

        let stem = dest
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = dest.extension().map(|e| e.to_string_lossy().into_owned());
        let parent = dest.parent().unwrap_or_else(|| Path::new(""));

        for n in 1.. {
            let candidate_name = match &ext {
                Some(ext) => format!("{} ({}).{}", stem, n, ext),
                None => format!("{} ({})", stem, n),
            };
            let candidate = parent.join(candidate_name);
            if !candidate.exists() {
                return candidate;
            }
        }
        unreachable!("counter loop always finds a free name");
    }
}

#[async_trait]
impl ArtifactStorage for FsArtifactStorage {
    async fn save(&self, bytes: &[u8], dest: &Path) -> Result<PathBuf> {
        if let Some(parent) = dest.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Download(DownloadError::WriteFailed {
                    path: parent.to_path_buf(),
                    reason: format!("failed to create directory: {}", e),
                })
            })?;
        }

        let final_path = Self::uniquify(dest);

        tokio::fs::write(&final_path, bytes).await.map_err(|e| {
            Error::Download(DownloadError::WriteFailed {
                path: final_path.clone(),
                reason: e.to_string(),
            })
        })?;

        Ok(final_path)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn save_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("nested/deep/image.png");

        let storage = FsArtifactStorage::new();
        let final_path = storage.save(b"png-bytes", &dest).await.unwrap();

        assert_eq!(final_path, dest);
        assert_eq!(std::fs::read(&final_path).unwrap(), b"png-bytes");
    }

    #[tokio::test]
    async fn save_uniquifies_on_collision() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("image.png");

        let storage = FsArtifactStorage::new();
        let first = storage.save(b"one", &dest).await.unwrap();
        let second = storage.save(b"two", &dest).await.unwrap();

        assert_eq!(first, dest);
        assert_ne!(second, first, "collision must not overwrite");
        assert_eq!(
            second.file_name().unwrap().to_string_lossy(),
            "image (1).png"
        );
        assert_eq!(std::fs::read(&first).unwrap(), b"one");
        assert_eq!(std::fs::read(&second).unwrap(), b"two");
    }

    #[tokio::test]
    async fn save_without_extension_uniquifies_cleanly() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("artifact");

        let storage = FsArtifactStorage::new();
        storage.save(b"a", &dest).await.unwrap();
        let second = storage.save(b"b", &dest).await.unwrap();

        assert_eq!(
            second.file_name().unwrap().to_string_lossy(),
            "artifact (1)"
        );
    }
}
