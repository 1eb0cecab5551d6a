//! Multi-symbol runner against offline CSV feeds.

use chunkvault_core::PollMode;
use chunkvault_runner::{
    backfill_all, build_pipelines, close_all, refresh_all, run_realtime, RefreshOptions,
    RunnerConfig, RunnerError,
};
use std::path::Path;
use tokio_util::sync::CancellationToken;

const SPY_FEED: &str = "date,close\n2024-01-02,470.1\n2024-01-03,468.8\n2024-01-04,467.3\n";
const QQQ_FEED: &str = "date,close\n2024-01-02,401.5\n2024-01-04,399.0\n";

fn write_config(dir: &Path, stocks: &str) -> RunnerConfig {
    std::fs::create_dir_all(dir.join("feeds")).unwrap();
    std::fs::write(dir.join("feeds/spy.csv"), SPY_FEED).unwrap();
    std::fs::write(dir.join("feeds/qqq.csv"), QQQ_FEED).unwrap();

    let text = format!(
        r#"
[data_pipelines]
provider = "csv_file"
base_path = "store"
chunk_size = 2
fetch_interval = 0
{stocks}
"#
    );
    let path = dir.join("run.toml");
    std::fs::write(&path, text).unwrap();
    RunnerConfig::from_file(&path).unwrap()
}

const TWO_STOCKS: &str = r#"
[[data_pipelines.stocks]]
symbol = "SPY"
full_name = "SPDR S&P 500 ETF"
source = "feeds/spy.csv"

[[data_pipelines.stocks]]
symbol = "QQQ"
source = "feeds/qqq.csv"
"#;

#[tokio::test]
async fn each_symbol_gets_its_own_store() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_config(dir.path(), TWO_STOCKS);
    let pipelines = build_pipelines(&cfg).unwrap();
    assert_eq!(pipelines.len(), 2);

    let frames = refresh_all(&pipelines, RefreshOptions::default()).await;
    assert_eq!(frames["SPY"].len(), 3);
    assert_eq!(frames["QQQ"].len(), 2);

    assert!(dir.path().join("store/SPY/chunk1.csv").exists());
    assert!(dir.path().join("store/QQQ/chunk0.csv").exists());
    assert!(!dir.path().join("store/QQQ/chunk1.csv").exists());

    close_all(pipelines).await.unwrap();
}

#[tokio::test]
async fn read_only_refresh_skips_empty_stores() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_config(dir.path(), TWO_STOCKS);
    let pipelines = build_pipelines(&cfg).unwrap();

    let options = RefreshOptions {
        read_only: true,
        ..RefreshOptions::default()
    };
    assert!(refresh_all(&pipelines, options).await.is_empty());
    close_all(pipelines).await.unwrap();
}

#[tokio::test]
async fn failing_symbol_is_left_out() {
    let dir = tempfile::tempdir().unwrap();
    let stocks = format!(
        "{TWO_STOCKS}\n[[data_pipelines.stocks]]\nsymbol = \"IWM\"\nsource = \"feeds/missing.csv\"\n"
    );
    let cfg = write_config(dir.path(), &stocks);
    let pipelines = build_pipelines(&cfg).unwrap();

    let frames = refresh_all(&pipelines, RefreshOptions::default()).await;
    let symbols: Vec<_> = frames.keys().map(String::as_str).collect();
    assert_eq!(symbols, vec!["QQQ", "SPY"]);
    close_all(pipelines).await.unwrap();
}

#[tokio::test]
async fn single_pass_realtime_runs_every_symbol_and_closes() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_config(dir.path(), TWO_STOCKS);
    let pipelines = build_pipelines(&cfg).unwrap();

    // a crashed run left a sentinel behind
    std::fs::write(dir.path().join("store/SPY/old.lock"), "lock").unwrap();

    let report = run_realtime(pipelines, CancellationToken::new(), PollMode::SingleFetch)
        .await
        .unwrap();

    assert_eq!(report.summaries.len(), 2);
    assert_eq!(report.summaries["SPY"].iterations, 1);
    assert_eq!(report.summaries["SPY"].rows_appended, 3);
    assert_eq!(report.summaries["QQQ"].rows_appended, 2);
    assert_eq!(report.locks_removed, 1);
    assert!(!dir.path().join("store/SPY/old.lock").exists());
}

#[tokio::test]
async fn cancelled_realtime_stops_all_loops() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_config(dir.path(), TWO_STOCKS);
    let pipelines = build_pipelines(&cfg).unwrap();
    let stop = CancellationToken::new();

    let task = tokio::spawn(run_realtime(pipelines, stop.clone(), PollMode::Continuous));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    stop.cancel();

    let report = tokio::time::timeout(std::time::Duration::from_secs(5), task)
        .await
        .expect("loops did not stop")
        .unwrap()
        .unwrap();
    assert!(report.summaries.values().all(|s| s.iterations >= 1));
    assert_eq!(report.summaries.values().map(|s| s.failures).sum::<u64>(), 0);
}

#[tokio::test]
async fn backfill_rewrites_configured_window() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_config(dir.path(), TWO_STOCKS);
    let pipelines = build_pipelines(&cfg).unwrap();

    let outcomes = backfill_all(&pipelines, None).await;
    assert_eq!(outcomes["SPY"].rows_written(), 3);
    assert_eq!(outcomes["QQQ"].rows_written(), 2);
    close_all(pipelines).await.unwrap();
}

#[tokio::test]
async fn empty_stock_list_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_config(dir.path(), "");
    assert!(matches!(build_pipelines(&cfg), Err(RunnerError::NoStocks)));
}

#[tokio::test]
async fn csv_provider_without_source_fails_to_build() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_config(dir.path(), "[[data_pipelines.stocks]]\nsymbol = \"SPY\"\n");
    assert!(matches!(
        build_pipelines(&cfg),
        Err(RunnerError::Provider { ref symbol, .. }) if symbol == "SPY"
    ));
}
