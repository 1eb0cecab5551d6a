//! Storage backends for chunk files.
//!
//! A backend knows how to address chunk `N` and move its text in and out.
//! Everything above it (rewrite, append, query, retention) is
//! backend-agnostic and lives in [`crate::store`].

pub mod local;
pub mod object;

pub use local::LocalBackend;
pub use object::ObjectBackend;

use crate::config::StorageType;
use crate::data::CodecError;
use crate::lock::LockError;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// File (or object) name for chunk `index`.
pub fn chunk_file_name(index: u64) -> String {
    format!("chunk{index}.csv")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object store: {0}")]
    Object(#[from] object_store::Error),

    #[error("chunk encoding: {0}")]
    Codec(#[from] CodecError),

    #[error("storage backend is closed")]
    Closed,
}

impl StoreError {
    pub(crate) fn io(path: impl fmt::Display, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_string(),
            source,
        }
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, StoreError::Lock(LockError::Timeout { .. }))
    }
}

/// Chunk persistence contract. Indices are addressed, never listed: the
/// store discovers the chunk count by probing from 0.
#[async_trait]
pub trait ChunkBackend: Send + Sync + fmt::Debug {
    fn kind(&self) -> StorageType;

    /// Human-readable location of chunk `index` (path or object key).
    fn location(&self, index: u64) -> String;

    /// Filesystem path to lock for chunk `index`, when the backend supports
    /// sentinel locking.
    fn lock_target(&self, _index: u64) -> Option<PathBuf> {
        None
    }

    fn supports_locking(&self) -> bool {
        false
    }

    async fn exists(&self, index: u64) -> Result<bool, StoreError>;

    /// Chunk text, or `None` when the chunk does not exist.
    async fn read(&self, index: u64) -> Result<Option<String>, StoreError>;

    /// Replace the chunk's content.
    async fn write(&self, index: u64, contents: String) -> Result<(), StoreError>;

    /// Remove the chunk. Removing an absent chunk succeeds.
    async fn delete(&self, index: u64) -> Result<(), StoreError>;

    /// Move chunk `from` to index `to`, replacing whatever is there.
    async fn rename(&self, from: u64, to: u64) -> Result<(), StoreError>;

    /// Remove leftover lock sentinels. Returns how many were removed.
    async fn sweep_locks(&self) -> Result<usize, StoreError> {
        Ok(0)
    }

    /// Release client handles.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
