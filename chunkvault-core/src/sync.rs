//! SyncOrchestrator: keeps a [`ChunkStore`] current from a [`DataProvider`].
//!
//! Three entry points:
//! - [`SyncOrchestrator::update_to_latest`] catches up from the stored tail
//!   (or the configured start) to now and appends.
//! - [`SyncOrchestrator::fetch_and_save_increment`] fetches whatever window
//!   the provider is set to and runs a full rewrite.
//! - [`SyncOrchestrator::fetch_and_save_realtime`] polls until stopped.

use crate::observability::pipeline_span;
use crate::provider::{DataProvider, FetchWindow, ProviderError};
use crate::store::{AppendSummary, ChunkStore, RewriteSummary, StoreError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("provider: {0}")]
    Provider(#[from] ProviderError),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SyncOutcome {
    /// The computed window was empty; nothing was fetched.
    UpToDate,
    /// The provider returned nothing newer than what is stored.
    NoNewData,
    Appended(AppendSummary),
    Rewritten(RewriteSummary),
}

impl SyncOutcome {
    /// Rows that reached storage.
    pub fn rows_written(&self) -> usize {
        match self {
            SyncOutcome::Appended(s) => s.appended_rows,
            SyncOutcome::Rewritten(s) => s.total_rows,
            SyncOutcome::UpToDate | SyncOutcome::NoNewData => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PollMode {
    #[default]
    Continuous,
    /// Run one iteration (the catch-up) and return.
    SingleFetch,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub iterations: u64,
    pub rows_appended: usize,
    pub failures: u64,
}

pub struct SyncOrchestrator {
    store: Arc<ChunkStore>,
    provider: Mutex<Box<dyn DataProvider>>,
    provider_name: String,
    symbol: String,
    configured: FetchWindow,
    fetch_interval: Duration,
}

impl SyncOrchestrator {
    /// The provider's window at this point becomes the configured window
    /// every catch-up is bounded by.
    pub fn new(
        store: Arc<ChunkStore>,
        provider: Box<dyn DataProvider>,
        fetch_interval: Duration,
    ) -> Self {
        Self {
            provider_name: provider.name().to_string(),
            symbol: provider.symbol().to_string(),
            configured: provider.window(),
            provider: Mutex::new(provider),
            store,
            fetch_interval,
        }
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn configured_window(&self) -> FetchWindow {
        self.configured
    }

    /// The provider's current window.
    pub async fn window(&self) -> FetchWindow {
        self.provider.lock().await.window()
    }

    /// Reposition the provider window, e.g. before a backfill.
    pub async fn set_window(&self, window: FetchWindow) {
        *self.provider.lock().await.window_mut() = window;
    }

    fn capped_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.configured.end.map_or(now, |e| e.min(now))
    }

    fn after(latest: DateTime<Utc>) -> DateTime<Utc> {
        latest + ChronoDuration::microseconds(1)
    }

    /// Catch up from the stored tail to now and append.
    pub async fn update_to_latest(&self) -> Result<SyncOutcome, SyncError> {
        let latest = self.store.latest_timestamp().await?;
        let start = match latest {
            Some(ts) => Some(Self::after(ts)),
            None => self.configured.start,
        };
        self.fetch_and_append(start).await
    }

    /// One poll iteration after the first: advance past the stored tail,
    /// fetch and append.
    pub async fn poll_once(&self) -> Result<SyncOutcome, SyncError> {
        let latest = self.store.latest_timestamp().await?;
        let start = match latest {
            Some(ts) => Some(Self::after(ts)),
            None => self.window().await.start,
        };
        self.fetch_and_append(start).await
    }

    async fn fetch_and_append(&self, start: Option<DateTime<Utc>>) -> Result<SyncOutcome, SyncError> {
        let end = self.capped_end(Utc::now());
        let window = FetchWindow::new(start, Some(end));

        let fetched = {
            let mut provider = self.provider.lock().await;
            *provider.window_mut() = window;
            if window.is_inverted() {
                debug!(symbol = %self.symbol, ?start, %end, "already up to date");
                return Ok(SyncOutcome::UpToDate);
            }
            provider.fetch().await?
        };

        if fetched.is_empty() {
            info!(symbol = %self.symbol, "no new data");
            return Ok(SyncOutcome::NoNewData);
        }

        let summary = self.store.incremental_append(fetched).await?;
        if summary.appended_rows == 0 {
            info!(symbol = %self.symbol, "no new data");
            return Ok(SyncOutcome::NoNewData);
        }
        let latest = self.store.latest_timestamp().await.ok().flatten();
        info!(
            symbol = %self.symbol,
            rows = summary.appended_rows,
            ?latest,
            "appended new data"
        );
        Ok(SyncOutcome::Appended(summary))
    }

    /// Fetch the provider's current window as-is and merge it with a full
    /// rewrite. For corrective backfills, not polling.
    pub async fn fetch_and_save_increment(&self) -> Result<SyncOutcome, SyncError> {
        let fetched = self.provider.lock().await.fetch().await?;
        if fetched.is_empty() {
            info!(symbol = %self.symbol, "no new data");
            return Ok(SyncOutcome::NoNewData);
        }
        let summary = self.store.full_rewrite(fetched).await?;
        Ok(SyncOutcome::Rewritten(summary))
    }

    /// Position the provider for polling. An empty store is caught up
    /// first; otherwise the window start moves just past the stored tail.
    pub async fn fetch_start(&self) -> Result<FetchWindow, SyncError> {
        match self.store.latest_timestamp().await? {
            None => {
                info!(symbol = %self.symbol, "no existing data, catching up");
                self.update_to_latest().await?;
            }
            Some(latest) => {
                info!(symbol = %self.symbol, %latest, "existing data found");
                self.provider.lock().await.window_mut().start = Some(Self::after(latest));
            }
        }
        let window = self.window().await;
        debug!(symbol = %self.symbol, start = ?window.start, "provider start set");
        Ok(window)
    }

    /// Poll until `stop` is cancelled (or once, in single-fetch mode).
    ///
    /// The first iteration is a catch-up. Iteration failures are logged and
    /// counted; the loop carries on at the next interval. `stop` is checked
    /// between iterations and cuts the sleep short, never an in-flight step.
    pub async fn fetch_and_save_realtime(&self, stop: &CancellationToken, mode: PollMode) -> PollSummary {
        let span = pipeline_span(&self.provider_name, &self.symbol, &self.store.config().base_path);
        self.poll_loop(stop, mode).instrument(span).await
    }

    async fn poll_loop(&self, stop: &CancellationToken, mode: PollMode) -> PollSummary {
        let mut summary = PollSummary::default();

        while !stop.is_cancelled() {
            let result = if summary.iterations == 0 {
                info!("starting initial catch-up");
                self.update_to_latest().await
            } else {
                debug!("starting poll cycle");
                self.poll_once().await
            };
            summary.iterations += 1;

            match result {
                Ok(outcome) => summary.rows_appended += outcome.rows_written(),
                Err(e) => {
                    summary.failures += 1;
                    error!(error = %e, iteration = summary.iterations, "poll iteration failed");
                }
            }

            if mode == PollMode::SingleFetch {
                debug!("single fetch completed");
                break;
            }

            debug!(secs = self.fetch_interval.as_secs_f64(), "waiting before next fetch");
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.fetch_interval) => {}
            }
        }

        info!(?summary, "poll loop stopped");
        summary
    }

    pub async fn ping(&self) -> bool {
        self.provider.lock().await.ping().await
    }

    pub async fn close_provider(&self) -> Result<(), ProviderError> {
        self.provider.lock().await.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::data::{Frame, Row};
    use crate::provider::MemoryProvider;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 21, 0, 0).unwrap()
    }

    fn orchestrator(dir: &std::path::Path, provider: MemoryProvider) -> SyncOrchestrator {
        let cfg = PipelineConfig::new(dir.to_string_lossy()).with_chunk_size(2);
        let store = Arc::new(ChunkStore::open(cfg).unwrap());
        SyncOrchestrator::new(store, Box::new(provider), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn catch_up_on_empty_store_uses_configured_start() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Frame = (1..=4).map(|d| Row::new(ts(d)).with("close", d as f64)).collect();
        let provider = MemoryProvider::new("SPY", FetchWindow::new(Some(ts(2)), None)).with_rows(rows);
        let sync = orchestrator(dir.path(), provider);

        let outcome = sync.update_to_latest().await.unwrap();
        assert_eq!(outcome.rows_written(), 3);
        assert_eq!(sync.window().await.start, Some(ts(2)));
    }

    #[tokio::test]
    async fn second_catch_up_starts_after_tail() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MemoryProvider::new("SPY", FetchWindow::unbounded());
        let feed = provider.feed();
        feed.push(Row::new(ts(2)).with("close", 2.0));
        let sync = orchestrator(dir.path(), provider);

        sync.update_to_latest().await.unwrap();
        assert_eq!(sync.update_to_latest().await.unwrap(), SyncOutcome::NoNewData);
        assert_eq!(sync.window().await.start, Some(ts(2) + ChronoDuration::microseconds(1)));
    }

    #[tokio::test]
    async fn end_in_the_past_before_tail_is_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MemoryProvider::new("SPY", FetchWindow::new(None, Some(ts(3))));
        provider.feed().push(Row::new(ts(3)).with("close", 3.0));
        let sync = orchestrator(dir.path(), provider);

        sync.update_to_latest().await.unwrap();
        assert_eq!(sync.update_to_latest().await.unwrap(), SyncOutcome::UpToDate);
    }

    #[tokio::test]
    async fn single_fetch_runs_one_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MemoryProvider::new("SPY", FetchWindow::unbounded());
        let feed = provider.feed();
        feed.push(Row::new(ts(2)).with("close", 2.0));
        let sync = orchestrator(dir.path(), provider);

        let summary = sync
            .fetch_and_save_realtime(&CancellationToken::new(), PollMode::SingleFetch)
            .await;
        assert_eq!(summary.iterations, 1);
        assert_eq!(summary.rows_appended, 1);
        assert_eq!(feed.fetch_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sync = orchestrator(dir.path(), MemoryProvider::new("SPY", FetchWindow::unbounded()));
        let stop = CancellationToken::new();
        stop.cancel();
        let summary = sync.fetch_and_save_realtime(&stop, PollMode::Continuous).await;
        assert_eq!(summary.iterations, 0);
    }
}
