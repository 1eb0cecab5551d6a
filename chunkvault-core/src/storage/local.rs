//! Local filesystem backend: `{base_path}/chunk{N}.csv`.

use super::{chunk_file_name, ChunkBackend, StoreError};
use crate::config::{ConfigError, StorageType};
use crate::lock::LOCK_SUFFIX;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct LocalBackend {
    base: PathBuf,
}

impl LocalBackend {
    /// Open the backend, creating `base` if it does not exist.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let base = base.into();
        std::fs::create_dir_all(&base).map_err(|source| ConfigError::BasePath {
            path: base.clone(),
            source,
        })?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn chunk_path(&self, index: u64) -> PathBuf {
        self.base.join(chunk_file_name(index))
    }

    fn tmp_path(&self, index: u64) -> PathBuf {
        self.base.join(format!("{}.tmp", chunk_file_name(index)))
    }
}

#[async_trait]
impl ChunkBackend for LocalBackend {
    fn kind(&self) -> StorageType {
        StorageType::Local
    }

    fn location(&self, index: u64) -> String {
        self.chunk_path(index).display().to_string()
    }

    fn lock_target(&self, index: u64) -> Option<PathBuf> {
        Some(self.chunk_path(index))
    }

    fn supports_locking(&self) -> bool {
        true
    }

    async fn exists(&self, index: u64) -> Result<bool, StoreError> {
        let path = self.chunk_path(index);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io(path.display(), e))
    }

    async fn read(&self, index: u64) -> Result<Option<String>, StoreError> {
        let path = self.chunk_path(index);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path.display(), e)),
        }
    }

    async fn write(&self, index: u64, contents: String) -> Result<(), StoreError> {
        let path = self.chunk_path(index);
        let tmp = self.tmp_path(index);

        // Write to .tmp then rename so readers never see a partial chunk.
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| StoreError::io(tmp.display(), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::io(path.display(), e))?;

        debug!(path = %path.display(), "chunk written");
        Ok(())
    }

    async fn delete(&self, index: u64) -> Result<(), StoreError> {
        let path = self.chunk_path(index);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path.display(), e)),
        }
    }

    async fn rename(&self, from: u64, to: u64) -> Result<(), StoreError> {
        let src = self.chunk_path(from);
        let dst = self.chunk_path(to);
        tokio::fs::rename(&src, &dst)
            .await
            .map_err(|e| StoreError::io(src.display(), e))
    }

    async fn sweep_locks(&self) -> Result<usize, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.base).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::io(self.base.display(), e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(self.base.display(), e))?
        {
            let path = entry.path();
            let is_lock = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(LOCK_SUFFIX));
            if !is_lock {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    info!(path = %path.display(), "removed stale lock");
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(path.display(), e)),
            }
        }
        Ok(removed)
    }
}
