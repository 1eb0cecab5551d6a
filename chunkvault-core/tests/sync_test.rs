//! Orchestrator and pipeline behaviour with scripted providers.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chunkvault_core::provider::{MemoryFeed, MemoryProvider};
use chunkvault_core::{
    DataProvider, FetchWindow, Frame, Pipeline, PipelineConfig, PipelineError, PollMode,
    ProviderError, Row, SyncOutcome,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn ts(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, day, 21, 0, 0).unwrap()
}

fn bar(day: u32) -> Row {
    Row::new(ts(day)).with("close", day as f64)
}

/// Serves a queue of scripted responses, then empty frames.
struct ScriptedProvider {
    window: FetchWindow,
    script: Mutex<VecDeque<Result<Frame, ProviderError>>>,
    seen: Arc<Mutex<Vec<FetchWindow>>>,
    closed: Arc<AtomicBool>,
}

impl ScriptedProvider {
    fn new(window: FetchWindow, script: Vec<Result<Frame, ProviderError>>) -> Self {
        Self {
            window,
            script: Mutex::new(script.into()),
            seen: Arc::default(),
            closed: Arc::default(),
        }
    }
}

#[async_trait]
impl DataProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn symbol(&self) -> &str {
        "TEST"
    }

    fn window(&self) -> FetchWindow {
        self.window
    }

    fn window_mut(&mut self) -> &mut FetchWindow {
        &mut self.window
    }

    async fn fetch(&self) -> Result<Frame, ProviderError> {
        self.seen.lock().unwrap().push(self.window);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Frame::new()))
    }

    async fn ping(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn config(dir: &std::path::Path) -> PipelineConfig {
    PipelineConfig::new(dir.to_string_lossy())
        .with_chunk_size(2)
        .with_fetch_interval(0)
}

fn memory_pipeline(dir: &std::path::Path, window: FetchWindow) -> (Pipeline, MemoryFeed) {
    let provider = MemoryProvider::new("SPY", window);
    let feed = provider.feed();
    (Pipeline::new(config(dir), Box::new(provider)).unwrap(), feed)
}

#[tokio::test]
async fn empty_store_catch_up_fetches_full_configured_window() {
    let dir = tempfile::tempdir().unwrap();
    let configured = FetchWindow::new(Some(ts(1)), Some(ts(20)));
    let provider = ScriptedProvider::new(configured, vec![Ok(Frame::from(vec![bar(3), bar(4)]))]);
    let seen = Arc::clone(&provider.seen);
    let pipeline = Pipeline::new(config(dir.path()), Box::new(provider)).unwrap();

    assert_eq!(pipeline.latest_timestamp().await.unwrap(), None);
    let outcome = pipeline.update_to_latest().await.unwrap();
    assert_eq!(outcome.rows_written(), 2);

    let windows = seen.lock().unwrap().clone();
    assert_eq!(windows, vec![configured]);
}

#[tokio::test]
async fn catch_up_advances_one_microsecond_past_tail() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(
        FetchWindow::unbounded(),
        vec![Ok(Frame::from(vec![bar(3)])), Ok(Frame::new())],
    );
    let seen = Arc::clone(&provider.seen);
    let pipeline = Pipeline::new(config(dir.path()), Box::new(provider)).unwrap();

    pipeline.update_to_latest().await.unwrap();
    assert_eq!(pipeline.update_to_latest().await.unwrap(), SyncOutcome::NoNewData);

    let second = seen.lock().unwrap()[1];
    assert_eq!(second.start, Some(ts(3) + chrono::Duration::microseconds(1)));
    assert!(second.end.unwrap() <= Utc::now());
}

#[tokio::test]
async fn catch_up_propagates_provider_errors() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(
        FetchWindow::unbounded(),
        vec![Err(ProviderError::NetworkUnreachable("down".into()))],
    );
    let pipeline = Pipeline::new(config(dir.path()), Box::new(provider)).unwrap();

    assert!(matches!(
        pipeline.update_to_latest().await,
        Err(PipelineError::Provider(ProviderError::NetworkUnreachable(_)))
    ));
}

#[tokio::test]
async fn increment_does_full_rewrite_of_provider_window() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, feed) = memory_pipeline(dir.path(), FetchWindow::unbounded());
    feed.extend(Frame::from(vec![bar(1), bar(2), bar(5)]));
    pipeline.update_to_latest().await.unwrap();

    // a late correction for the gap at day 3 and 4
    let backfill = FetchWindow::new(Some(ts(3)), Some(ts(4)));
    feed.extend(Frame::from(vec![bar(3), bar(4)]));
    let outcome = pipeline.backfill(backfill).await.unwrap();
    match outcome {
        SyncOutcome::Rewritten(summary) => {
            assert_eq!(summary.total_rows, 5);
            assert_eq!(summary.chunk_count, 3);
        }
        other => panic!("expected rewrite, got {other:?}"),
    }

    let all = pipeline.read_range(None, None).await.unwrap();
    let days: Vec<_> = all.rows().iter().map(|r| r.timestamp).collect();
    assert_eq!(days, (1..=5).map(ts).collect::<Vec<_>>());
}

#[tokio::test]
async fn fetch_start_positions_provider_after_tail() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, feed) = memory_pipeline(dir.path(), FetchWindow::unbounded());
    feed.push(bar(1));

    // empty store: catches up
    pipeline.fetch_start().await.unwrap();
    assert_eq!(pipeline.latest_timestamp().await.unwrap(), Some(ts(1)));

    let window = pipeline.fetch_start().await.unwrap();
    assert_eq!(window.start, Some(ts(1) + chrono::Duration::microseconds(1)));
}

#[tokio::test]
async fn poll_loop_survives_provider_failures() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(
        FetchWindow::unbounded(),
        vec![
            Ok(Frame::from(vec![bar(1)])),
            Err(ProviderError::RateLimited { retry_after_secs: 1 }),
            Err(ProviderError::NetworkUnreachable("flaky".into())),
            Ok(Frame::from(vec![bar(2), bar(3)])),
        ],
    );
    let seen = Arc::clone(&provider.seen);
    let pipeline = Arc::new(Pipeline::new(config(dir.path()), Box::new(provider)).unwrap());
    let stop = CancellationToken::new();

    let task = {
        let pipeline = Arc::clone(&pipeline);
        let stop = stop.clone();
        tokio::spawn(async move { pipeline.fetch_and_save_realtime(&stop, PollMode::Continuous).await })
    };

    // wait until the scripted responses are used up
    for _ in 0..500 {
        if seen.lock().unwrap().len() >= 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    stop.cancel();
    let summary = task.await.unwrap();

    assert!(summary.iterations >= 4);
    assert_eq!(summary.failures, 2);
    assert_eq!(summary.rows_appended, 3);
    assert_eq!(pipeline.read_range(None, None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn stop_signal_wakes_long_sleep() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path()).with_fetch_interval(3600);
    let pipeline = Arc::new(
        Pipeline::new(cfg, Box::new(MemoryProvider::new("SPY", FetchWindow::unbounded()))).unwrap(),
    );
    let stop = CancellationToken::new();

    let task = {
        let pipeline = Arc::clone(&pipeline);
        let stop = stop.clone();
        tokio::spawn(async move { pipeline.fetch_and_save_realtime(&stop, PollMode::Continuous).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("loop did not stop")
        .unwrap();
    assert_eq!(summary.iterations, 1);
}

#[tokio::test]
async fn close_releases_provider_and_sweeps_locks() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(FetchWindow::unbounded(), vec![]);
    let closed = Arc::clone(&provider.closed);
    let pipeline = Pipeline::new(config(dir.path()), Box::new(provider)).unwrap();

    std::fs::write(dir.path().join("chunk0.csv.lock"), "lock").unwrap();
    std::fs::write(dir.path().join("stale.lock"), "lock").unwrap();

    let report = pipeline.close().await.unwrap();
    assert!(closed.load(Ordering::SeqCst));
    assert_eq!(report.locks_removed, 2);
    assert!(!dir.path().join("stale.lock").exists());
}
