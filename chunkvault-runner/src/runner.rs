//! Multi-symbol orchestration: one pipeline per configured symbol, driven
//! together.

use crate::config::{RunnerConfig, RunnerError};
use chunkvault_core::provider::CircuitBreaker;
use chunkvault_core::store::CloseReport;
use chunkvault_core::{
    FetchWindow, Frame, Pipeline, PipelineError, PollMode, PollSummary, ProviderSpec, SyncOutcome,
};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Build one pipeline per configured symbol.
///
/// Every Yahoo provider shares a single circuit breaker so a rate limit
/// seen by one symbol pauses them all.
pub fn build_pipelines(config: &RunnerConfig) -> Result<Vec<Pipeline>, RunnerError> {
    if config.stocks().is_empty() {
        return Err(RunnerError::NoStocks);
    }
    let settings = &config.pipelines;
    let breaker = Arc::new(CircuitBreaker::default_provider());

    let mut pipelines = Vec::with_capacity(config.stocks().len());
    for stock in config.stocks() {
        let mut spec = ProviderSpec::new(stock.symbol.clone(), config.window());
        spec.interval = stock.interval.unwrap_or(settings.interval);
        spec.period = settings.period.clone();
        spec.source = config.source_path(stock);
        spec.circuit_breaker = Some(Arc::clone(&breaker));

        let provider = settings
            .provider
            .build(&spec)
            .map_err(|source| RunnerError::Provider {
                symbol: stock.symbol.clone(),
                source,
            })?;
        let pipeline = Pipeline::new(config.pipeline_config(&stock.symbol), provider)?;
        info!(
            symbol = %stock.symbol,
            provider = %settings.provider,
            base_path = %pipeline.config().base_path,
            "created pipeline"
        );
        pipelines.push(pipeline);
    }

    info!(count = pipelines.len(), "created data pipelines");
    Ok(pipelines)
}

/// Per-symbol poll summaries plus the teardown result.
#[derive(Debug, Default)]
pub struct RealtimeReport {
    pub summaries: BTreeMap<String, PollSummary>,
    pub locks_removed: usize,
}

/// Run every pipeline's poll loop concurrently until `stop` fires (or each
/// has made its single pass), then close all of them.
///
/// A loop that dies takes the others down with it. Every pipeline is closed
/// regardless; the first close failure is returned.
pub async fn run_realtime(
    pipelines: Vec<Pipeline>,
    stop: CancellationToken,
    mode: PollMode,
) -> Result<RealtimeReport, RunnerError> {
    let pipelines: Vec<Arc<Pipeline>> = pipelines.into_iter().map(Arc::new).collect();
    let mut tasks = JoinSet::new();
    for pipeline in &pipelines {
        let pipeline = Arc::clone(pipeline);
        let stop = stop.clone();
        tasks.spawn(async move {
            let summary = pipeline.fetch_and_save_realtime(&stop, mode).await;
            (pipeline.symbol().to_string(), summary)
        });
    }
    info!(count = pipelines.len(), "started realtime updates");

    let mut report = RealtimeReport::default();
    let mut task_failure = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((symbol, summary)) => {
                report.summaries.insert(symbol, summary);
            }
            Err(e) => {
                error!(error = %e, "realtime task failed, stopping all pipelines");
                stop.cancel();
                task_failure.get_or_insert(e.to_string());
            }
        }
    }

    let mut owned = Vec::with_capacity(pipelines.len());
    for pipeline in pipelines {
        match Arc::try_unwrap(pipeline) {
            Ok(pipeline) => owned.push(pipeline),
            Err(shared) => warn!(symbol = %shared.symbol(), "pipeline still shared after shutdown, skipping close"),
        }
    }
    let closed = close_all(owned).await;
    info!("all data pipelines closed");
    report.locks_removed = closed?.locks_removed;

    match task_failure {
        Some(reason) => Err(RunnerError::Task(reason)),
        None => Ok(report),
    }
}

/// How `refresh_all` treats each symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOptions {
    /// Load only the last N days; `None` loads everything.
    pub n_days: Option<u32>,
    /// Skip the catch-up and only read what is stored.
    pub read_only: bool,
}

/// Catch every pipeline up (unless read-only) and load its data,
/// concurrently. Symbols that fail or hold no data are logged and left out.
pub async fn refresh_all(pipelines: &[Pipeline], options: RefreshOptions) -> BTreeMap<String, Frame> {
    let loaded = join_all(pipelines.iter().map(|p| refresh_one(p, options))).await;
    let frames: BTreeMap<String, Frame> = loaded.into_iter().flatten().collect();
    info!(loaded = frames.len(), total = pipelines.len(), "refresh completed");
    frames
}

async fn refresh_one(pipeline: &Pipeline, options: RefreshOptions) -> Option<(String, Frame)> {
    let symbol = pipeline.symbol().to_string();
    info!(%symbol, read_only = options.read_only, "processing symbol");

    let result: Result<Frame, PipelineError> = async {
        if !options.read_only {
            pipeline.update_to_latest().await?;
        }
        match options.n_days {
            Some(days) => pipeline.latest_n_days(days).await,
            None => pipeline.read_range(None, None).await,
        }
    }
    .await;

    match result {
        Ok(frame) if frame.is_empty() => {
            warn!(%symbol, "no data loaded");
            None
        }
        Ok(frame) => {
            info!(
                %symbol,
                rows = frame.len(),
                first = ?frame.min_timestamp(),
                last = ?frame.max_timestamp(),
                "loaded data"
            );
            Some((symbol, frame))
        }
        Err(e) => {
            error!(%symbol, error = %e, "failed to process symbol");
            None
        }
    }
}

/// Full-rewrite every pipeline over `window` (its configured window when
/// `None`). Failures are logged and the symbol is left out of the result.
pub async fn backfill_all(
    pipelines: &[Pipeline],
    window: Option<FetchWindow>,
) -> BTreeMap<String, SyncOutcome> {
    let outcomes = join_all(pipelines.iter().map(|p| async move {
        let symbol = p.symbol().to_string();
        let window = match window {
            Some(w) => w,
            None => p.configured_window(),
        };
        match p.backfill(window).await {
            Ok(outcome) => {
                info!(%symbol, rows = outcome.rows_written(), "backfill completed");
                Some((symbol, outcome))
            }
            Err(e) => {
                error!(%symbol, error = %e, "backfill failed");
                None
            }
        }
    }))
    .await;
    outcomes.into_iter().flatten().collect()
}

/// Close every pipeline, returning the summed report or the first failure.
pub async fn close_all(pipelines: Vec<Pipeline>) -> Result<CloseReport, RunnerError> {
    let mut report = CloseReport::default();
    let mut first_error = None;
    for pipeline in pipelines {
        let symbol = pipeline.symbol().to_string();
        match pipeline.close().await {
            Ok(closed) => report.locks_removed += closed.locks_removed,
            Err(source) => {
                first_error.get_or_insert(RunnerError::Pipeline { symbol, source });
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(report),
    }
}
