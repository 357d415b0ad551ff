//! Write-once archive files for retention exports.

use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub sha256: String,
    pub byte_size: u64,
}

#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `{kind}/{period}/{file_name}` under the archive root.
    pub fn period_path(kind: &str, period: &str, file_name: &str) -> PathBuf {
        PathBuf::from(kind).join(period).join(file_name)
    }

    /// Writes `bytes` through a temp file in the target directory and renames
    /// it into place, replacing any earlier export of the same path.
    pub async fn write_atomic(&self, relative_path: &Path, bytes: &[u8]) -> anyhow::Result<StoredFile> {
        let absolute_path = self.root.join(relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp archive file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp archive {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredFile {
            relative_path: relative_path.to_path_buf(),
            absolute_path,
            sha256: Self::sha256_hex(bytes),
            byte_size: bytes.len() as u64,
        })
    }

    /// Re-reads a written file and checks it against the recorded digest.
    pub async fn verify(&self, stored: &StoredFile) -> anyhow::Result<bool> {
        let bytes = fs::read(&stored.absolute_path)
            .await
            .with_context(|| format!("reading archive file {}", stored.absolute_path.display()))?;
        Ok(bytes.len() as u64 == stored.byte_size && Self::sha256_hex(&bytes) == stored.sha256)
    }
}
