//! Pipeline: one provider feeding one chunk store, with construction-time
//! validation and an explicit teardown.

use crate::config::{ConfigError, PipelineConfig, StorageType};
use crate::data::Frame;
use crate::provider::{DataProvider, FetchWindow, ProviderError};
use crate::store::{ChunkStore, CloseReport, StoreError};
use crate::sync::{PollMode, PollSummary, SyncError, SyncOrchestrator, SyncOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("provider: {0}")]
    Provider(#[from] ProviderError),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl From<SyncError> for PipelineError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Provider(e) => PipelineError::Provider(e),
            SyncError::Store(e) => PipelineError::Store(e),
        }
    }
}

/// Serialisable snapshot of a pipeline's settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineParams {
    pub provider: String,
    pub symbol: String,
    pub base_path: String,
    pub use_lock: bool,
    pub cache_days: u32,
    pub chunk_size: usize,
    pub storage_type: StorageType,
    pub bucket_name: Option<String>,
    pub fetch_interval: u64,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<ChunkStore>,
    sync: SyncOrchestrator,
}

impl Pipeline {
    /// Validate `config`, open its store (creating a local base path) and
    /// attach `provider`.
    pub fn new(config: PipelineConfig, provider: Box<dyn DataProvider>) -> Result<Self, ConfigError> {
        let store = ChunkStore::open(config.clone())?;
        Ok(Self::with_store(store, provider))
    }

    /// Attach `provider` to an already opened store.
    pub fn with_store(store: ChunkStore, provider: Box<dyn DataProvider>) -> Self {
        let config = store.config().clone();
        let store = Arc::new(store);
        let sync = SyncOrchestrator::new(Arc::clone(&store), provider, config.fetch_interval());
        Self { config, store, sync }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn symbol(&self) -> &str {
        self.sync.symbol()
    }

    /// The provider window the pipeline was built with.
    pub fn configured_window(&self) -> FetchWindow {
        self.sync.configured_window()
    }

    pub fn params(&self) -> PipelineParams {
        PipelineParams {
            provider: self.sync.provider_name().to_string(),
            symbol: self.sync.symbol().to_string(),
            base_path: self.config.base_path.clone(),
            use_lock: self.config.use_lock,
            cache_days: self.config.cache_days,
            chunk_size: self.config.chunk_size,
            storage_type: self.config.storage_type,
            bucket_name: self.config.bucket_name.clone(),
            fetch_interval: self.config.fetch_interval,
        }
    }

    pub async fn update_to_latest(&self) -> Result<SyncOutcome, PipelineError> {
        Ok(self.sync.update_to_latest().await?)
    }

    pub async fn fetch_and_save_increment(&self) -> Result<SyncOutcome, PipelineError> {
        Ok(self.sync.fetch_and_save_increment().await?)
    }

    /// Rewrite-merge the rows of `window` from the provider.
    pub async fn backfill(&self, window: FetchWindow) -> Result<SyncOutcome, PipelineError> {
        self.sync.set_window(window).await;
        self.fetch_and_save_increment().await
    }

    pub async fn fetch_start(&self) -> Result<FetchWindow, PipelineError> {
        Ok(self.sync.fetch_start().await?)
    }

    pub async fn fetch_and_save_realtime(&self, stop: &CancellationToken, mode: PollMode) -> PollSummary {
        self.sync.fetch_and_save_realtime(stop, mode).await
    }

    pub async fn read_range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Frame, PipelineError> {
        Ok(self.store.read_range(start, end).await?)
    }

    pub async fn latest_n_days(&self, days: u32) -> Result<Frame, PipelineError> {
        Ok(self.store.latest_n_days(days).await?)
    }

    pub async fn load_cache(&self) -> Result<Frame, PipelineError> {
        Ok(self.store.load_cache().await?)
    }

    pub async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>, PipelineError> {
        Ok(self.store.latest_timestamp().await?)
    }

    pub async fn ping(&self) -> bool {
        self.sync.ping().await
    }

    /// Tear down: close the provider, then the store (which disposes the
    /// backend client and sweeps stale locks). Every step runs; the first
    /// failure is returned.
    pub async fn close(self) -> Result<CloseReport, PipelineError> {
        let symbol = self.sync.symbol().to_string();
        let mut first: Option<PipelineError> = None;

        if let Err(e) = self.sync.close_provider().await {
            error!(%symbol, error = %e, "failed to close provider");
            first.get_or_insert(e.into());
        }

        let report = match self.store.close().await {
            Ok(report) => report,
            Err(e) => {
                error!(%symbol, error = %e, "failed to close store");
                first.get_or_insert(e.into());
                CloseReport::default()
            }
        };

        match first {
            Some(e) => Err(e),
            None => {
                info!(%symbol, locks_removed = report.locks_removed, "pipeline closed");
                Ok(report)
            }
        }
    }
}
