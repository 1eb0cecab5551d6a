//! Pipeline configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CHUNK_SIZE: usize = 10_000;
pub const DEFAULT_CACHE_DAYS: u32 = 7;
pub const DEFAULT_FETCH_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_LOCK_ATTEMPTS: u32 = 10;
pub const DEFAULT_LOCK_BACKOFF_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported storage type: '{0}' (expected 'local' or 'object')")]
    UnknownStorageType(String),

    #[error("bucket_name must be provided for object storage")]
    MissingBucket,

    #[error("chunk_size must be greater than zero")]
    InvalidChunkSize,

    #[error("failed to create base path {path}: {source}")]
    BasePath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("object store client: {0}")]
    ObjectStore(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Where chunks are persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// One file per chunk under `base_path`.
    #[default]
    Local,
    /// One object per chunk under `bucket_name`, keyed by `base_path`.
    #[serde(alias = "gcs")]
    Object,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Local => "local",
            StorageType::Object => "object",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(StorageType::Local),
            "object" | "gcs" => Ok(StorageType::Object),
            other => Err(ConfigError::UnknownStorageType(other.to_string())),
        }
    }
}

/// Retry budget for chunk lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_lock_backoff_ms")]
    pub backoff_ms: u64,
}

impl LockConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_LOCK_ATTEMPTS,
            backoff_ms: DEFAULT_LOCK_BACKOFF_MS,
        }
    }
}

/// Configuration for one pipeline (one series, one `base_path`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory (local) or key prefix (object storage) holding the chunks.
    pub base_path: String,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_cache_days")]
    pub cache_days: u32,

    #[serde(default)]
    pub storage_type: StorageType,

    #[serde(default)]
    pub bucket_name: Option<String>,

    #[serde(default = "default_true")]
    pub use_lock: bool,

    /// Seconds between poll iterations.
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval: u64,

    #[serde(default)]
    pub lock: LockConfig,
}

impl PipelineConfig {
    /// Local-storage config with every other setting at its default.
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            cache_days: DEFAULT_CACHE_DAYS,
            storage_type: StorageType::Local,
            bucket_name: None,
            use_lock: true,
            fetch_interval: DEFAULT_FETCH_INTERVAL_SECS,
            lock: LockConfig::default(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_cache_days(mut self, days: u32) -> Self {
        self.cache_days = days;
        self
    }

    pub fn with_object_storage(mut self, bucket_name: impl Into<String>) -> Self {
        self.storage_type = StorageType::Object;
        self.bucket_name = Some(bucket_name.into());
        self
    }

    pub fn with_lock(mut self, use_lock: bool) -> Self {
        self.use_lock = use_lock;
        self
    }

    pub fn with_lock_config(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_fetch_interval(mut self, secs: u64) -> Self {
        self.fetch_interval = secs;
        self
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval)
    }

    /// Whether chunk access goes through sentinel locks.
    pub fn locking_enabled(&self) -> bool {
        self.storage_type == StorageType::Local && self.use_lock
    }

    /// Check the settings that are fatal at construction time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize);
        }
        if self.base_path.trim().is_empty() {
            return Err(ConfigError::Invalid("base_path is empty".into()));
        }
        if self.storage_type == StorageType::Object
            && self.bucket_name.as_deref().map_or(true, |b| b.trim().is_empty())
        {
            return Err(ConfigError::MissingBucket);
        }
        if self.lock.max_attempts == 0 {
            return Err(ConfigError::Invalid("lock.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_cache_days() -> u32 {
    DEFAULT_CACHE_DAYS
}

fn default_fetch_interval() -> u64 {
    DEFAULT_FETCH_INTERVAL_SECS
}

fn default_true() -> bool {
    true
}

fn default_lock_attempts() -> u32 {
    DEFAULT_LOCK_ATTEMPTS
}

fn default_lock_backoff_ms() -> u64 {
    DEFAULT_LOCK_BACKOFF_MS
}
