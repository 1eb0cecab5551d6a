//! Sentinel-file locks for local chunk files.
//!
//! A lock on `chunk3.csv` is the file `chunk3.csv.lock`. Acquisition retries
//! on a fixed backoff and gives up with [`LockError::Timeout`]. Within one
//! process the check-and-create step runs under a mutex; across processes
//! the create-new open is the only guard.

use crate::config::LockConfig;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Suffix appended to a chunk location to form its sentinel.
pub const LOCK_SUFFIX: &str = ".lock";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("could not acquire lock {path} after {attempts} attempts")]
    Timeout { path: PathBuf, attempts: u32 },

    #[error("lock I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Sentinel path for a chunk location.
pub fn sentinel_path(location: &Path) -> PathBuf {
    let mut s: OsString = location.as_os_str().to_owned();
    s.push(LOCK_SUFFIX);
    PathBuf::from(s)
}

/// Lock factory for one store. Each store owns its own gate, so independent
/// pipelines never contend.
#[derive(Debug)]
pub struct FileLock {
    config: LockConfig,
    gate: Mutex<()>,
}

impl FileLock {
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            gate: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire the lock for `location`.
    ///
    /// Makes up to `max_attempts` tries, sleeping `backoff` after each miss.
    pub async fn acquire(&self, location: &Path) -> Result<LockGuard, LockError> {
        let sentinel = sentinel_path(location);
        let attempts = self.config.max_attempts.max(1);

        for attempt in 1..=attempts {
            if self.try_create(&sentinel).await? {
                debug!(path = %sentinel.display(), attempt, "lock acquired");
                return Ok(LockGuard {
                    sentinel,
                    released: false,
                });
            }
            debug!(path = %sentinel.display(), attempt, "lock busy, backing off");
            tokio::time::sleep(self.config.backoff()).await;
        }

        warn!(path = %sentinel.display(), attempts, "lock acquisition timed out");
        Err(LockError::Timeout {
            path: sentinel,
            attempts,
        })
    }

    async fn try_create(&self, sentinel: &Path) -> Result<bool, LockError> {
        let _gate = self.gate.lock().await;

        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(sentinel)
            .await;

        match opened {
            Ok(mut file) => {
                // tokio finishes writes in the background unless flushed
                let written = match file.write_all(b"lock").await {
                    Ok(()) => file.flush().await,
                    Err(e) => Err(e),
                };
                written.map_err(|source| LockError::Io {
                    path: sentinel.to_path_buf(),
                    source,
                })?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(LockError::Io {
                path: sentinel.to_path_buf(),
                source,
            }),
        }
    }
}

/// Held lock. Call [`LockGuard::release`] when done; dropping an unreleased
/// guard removes the sentinel synchronously.
#[derive(Debug)]
#[must_use = "dropping the guard releases the lock"]
pub struct LockGuard {
    sentinel: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.sentinel
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        match tokio::fs::remove_file(&self.sentinel).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %self.sentinel.display(), "lock sentinel vanished before release");
                Ok(())
            }
            Err(source) => Err(LockError::Io {
                path: self.sentinel.clone(),
                source,
            }),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.sentinel) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.sentinel.display(), error = %e, "failed to remove lock sentinel");
            }
        }
    }
}
