//! chunkvault core: chunked time-series storage kept in sync with a data provider.
//!
//! This crate contains the storage engine and everything that feeds it:
//! - Row/frame data model and the chunk CSV codec
//! - Sentinel-file locks for local chunk files
//! - Local and object storage backends behind one async trait
//! - `ChunkStore`: full rewrite, incremental append, range query, retention
//! - The `DataProvider` contract, built-in providers and their registry
//! - `SyncOrchestrator` (catch-up, increment, polling) and `Pipeline` lifecycle

pub mod config;
pub mod data;
pub mod lock;
pub mod observability;
pub mod pipeline;
pub mod provider;
pub mod storage;
pub mod store;
pub mod sync;

pub use config::{ConfigError, LockConfig, PipelineConfig, StorageType};
pub use data::{FieldValue, Frame, Row};
pub use pipeline::{Pipeline, PipelineError, PipelineParams};
pub use provider::{DataProvider, FetchWindow, ProviderError, ProviderKind, ProviderSpec};
pub use store::{ChunkStore, StoreError};
pub use sync::{PollMode, PollSummary, SyncError, SyncOrchestrator, SyncOutcome};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: everything a pipeline task holds is Send + Sync,
    /// so pipelines can run on the multi-threaded runtime.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<Row>();
        require_sync::<Row>();
        require_send::<Frame>();
        require_sync::<Frame>();
        require_send::<PipelineConfig>();
        require_sync::<PipelineConfig>();

        require_send::<ChunkStore>();
        require_sync::<ChunkStore>();
        require_send::<SyncOrchestrator>();
        require_sync::<SyncOrchestrator>();
        require_send::<Pipeline>();
        require_sync::<Pipeline>();

        require_send::<lock::FileLock>();
        require_sync::<lock::FileLock>();
        require_send::<storage::LocalBackend>();
        require_sync::<storage::LocalBackend>();
        require_send::<storage::ObjectBackend>();
        require_sync::<storage::ObjectBackend>();

        require_send::<provider::YahooProvider>();
        require_sync::<provider::YahooProvider>();
        require_send::<provider::CsvFileProvider>();
        require_sync::<provider::CsvFileProvider>();
        require_send::<provider::MemoryProvider>();
        require_sync::<provider::MemoryProvider>();

        require_send::<StoreError>();
        require_send::<ProviderError>();
        require_send::<PipelineError>();
    }

    /// Pipeline futures must be spawnable on a multi-threaded runtime.
    #[test]
    fn pipeline_futures_are_send() {
        fn require_send_future<F: std::future::Future + Send>(_: F) {}
        #[allow(dead_code)]
        fn check(pipeline: &Pipeline, stop: &tokio_util::sync::CancellationToken) {
            require_send_future(pipeline.fetch_and_save_realtime(stop, PollMode::Continuous));
            require_send_future(pipeline.update_to_latest());
            require_send_future(pipeline.fetch_and_save_increment());
            require_send_future(pipeline.fetch_start());
            require_send_future(pipeline.read_range(None, None));
        }
        #[allow(dead_code)]
        fn check_orchestrator(sync: &SyncOrchestrator) {
            require_send_future(sync.update_to_latest());
            require_send_future(sync.poll_once());
        }
    }
}
