//! chunkvault CLI: keep chunked price series in sync and inspect them.
//!
//! Commands:
//! - `sync`: run every configured symbol's poll loop until Ctrl-C
//! - `update`: catch every symbol up once and report what is stored
//! - `backfill`: full-rewrite every symbol over the configured window
//! - `query`: print the rows of one store in a date range
//! - `clean`: delete chunks older than N days from one store
//! - `status`: per-chunk row counts and date ranges of one store
//! - `prepare`: align one field across all symbols and print the matrix

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chunkvault_core::data::codec::{encode, format_timestamp, parse_timestamp};
use chunkvault_core::observability::{init_logging, LogFormat};
use chunkvault_core::{ChunkStore, FetchWindow, PipelineConfig, PollMode, StorageType};
use chunkvault_runner::{
    backfill_all, build_pipelines, close_all, prepare_matrix, refresh_all, run_realtime,
    AlignedMatrix, Frequency, RefreshOptions, RunnerConfig,
};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "chunkvault", about = "chunkvault: chunked time-series store kept in sync with market data")]
struct Cli {
    /// Log output: pretty or json. Levels come from RUST_LOG.
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured symbol's poll loop until Ctrl-C.
    Sync {
        /// Path to the TOML run configuration.
        #[arg(long)]
        config: PathBuf,

        /// Catch up once and exit instead of polling.
        #[arg(long, default_value_t = false)]
        once: bool,
    },
    /// Catch every symbol up and report what is stored.
    Update {
        #[arg(long)]
        config: PathBuf,

        /// Only read what is stored; do not contact the provider.
        #[arg(long, default_value_t = false)]
        read_only: bool,

        /// Load only the last N days.
        #[arg(long)]
        days: Option<u32>,
    },
    /// Full-rewrite every symbol over a window (the configured one by default).
    Backfill {
        #[arg(long)]
        config: PathBuf,

        /// Window start (YYYY-MM-DD or RFC 3339).
        #[arg(long, value_parser = parse_when)]
        start: Option<DateTime<Utc>>,

        /// Window end (YYYY-MM-DD or RFC 3339).
        #[arg(long, value_parser = parse_when)]
        end: Option<DateTime<Utc>>,
    },
    /// Print the rows of one store, inclusive of both bounds.
    Query {
        #[command(flatten)]
        store: StoreArgs,

        #[arg(long, value_parser = parse_when)]
        start: Option<DateTime<Utc>>,

        #[arg(long, value_parser = parse_when)]
        end: Option<DateTime<Utc>>,

        /// Print JSON instead of CSV.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Delete whole chunks whose newest row is older than N days.
    Clean {
        #[command(flatten)]
        store: StoreArgs,

        #[arg(long)]
        days: u32,
    },
    /// Per-chunk row counts and date ranges of one store.
    Status {
        #[command(flatten)]
        store: StoreArgs,

        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Align one field across all configured symbols and print it as CSV.
    Prepare {
        #[arg(long)]
        config: PathBuf,

        /// Numeric field to extract, e.g. close.
        #[arg(long, default_value = "close")]
        field: String,

        /// Bucket size: minute, hour or day.
        #[arg(long, default_value = "day")]
        frequency: Frequency,

        /// Use only the last N days.
        #[arg(long)]
        days: Option<u32>,

        /// Skip the catch-up and align what is stored.
        #[arg(long, default_value_t = false)]
        read_only: bool,

        /// Worker threads for the alignment pool.
        #[arg(long)]
        threads: Option<usize>,
    },
}

/// Where a single store lives.
#[derive(Args)]
struct StoreArgs {
    /// Directory (local) or key prefix (object) of the store.
    #[arg(long)]
    base_path: String,

    /// local or object (alias gcs).
    #[arg(long, default_value = "local")]
    storage_type: StorageType,

    /// Bucket name, required for object storage.
    #[arg(long)]
    bucket: Option<String>,

    /// Do not take chunk locks.
    #[arg(long, default_value_t = false)]
    no_lock: bool,
}

impl StoreArgs {
    fn open(&self) -> Result<ChunkStore> {
        let mut config = PipelineConfig::new(self.base_path.clone()).with_lock(!self.no_lock);
        if self.storage_type == StorageType::Object {
            let bucket = self
                .bucket
                .clone()
                .context("--bucket is required for object storage")?;
            config = config.with_object_storage(bucket);
        }
        ChunkStore::open(config).with_context(|| format!("opening store at {}", self.base_path))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match cli.command {
        Commands::Sync { config, once } => run_sync(config, once).await,
        Commands::Update {
            config,
            read_only,
            days,
        } => run_update(config, read_only, days).await,
        Commands::Backfill { config, start, end } => run_backfill(config, start, end).await,
        Commands::Query {
            store,
            start,
            end,
            json,
        } => run_query(&store, start, end, json).await,
        Commands::Clean { store, days } => run_clean(&store, days).await,
        Commands::Status { store, json } => run_status(&store, json).await,
        Commands::Prepare {
            config,
            field,
            frequency,
            days,
            read_only,
            threads,
        } => run_prepare(config, field, frequency, days, read_only, threads).await,
    }
}

fn parse_when(s: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(s).ok_or_else(|| format!("not a date or timestamp: '{s}'"))
}

fn load_config(path: &Path) -> Result<RunnerConfig> {
    RunnerConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

/// Cancel `stop` on Ctrl-C.
fn cancel_on_interrupt(stop: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping all pipelines");
            stop.cancel();
        }
    });
}

async fn run_sync(config: PathBuf, once: bool) -> Result<()> {
    let config = load_config(&config)?;
    let pipelines = build_pipelines(&config)?;

    let stop = CancellationToken::new();
    cancel_on_interrupt(stop.clone());
    let mode = if once { PollMode::SingleFetch } else { PollMode::Continuous };

    let report = run_realtime(pipelines, stop, mode).await?;

    println!("{:<10} {:>10} {:>10} {:>10}", "Symbol", "Polls", "Rows", "Failures");
    println!("{}", "-".repeat(43));
    for (symbol, s) in &report.summaries {
        println!("{:<10} {:>10} {:>10} {:>10}", symbol, s.iterations, s.rows_appended, s.failures);
    }
    if report.locks_removed > 0 {
        println!("Removed {} stale lock(s).", report.locks_removed);
    }
    Ok(())
}

async fn run_update(config: PathBuf, read_only: bool, days: Option<u32>) -> Result<()> {
    let config = load_config(&config)?;
    let names = config.symbol_mapper();
    let pipelines = build_pipelines(&config)?;

    let frames = refresh_all(&pipelines, RefreshOptions { n_days: days, read_only }).await;
    close_all(pipelines).await?;

    if frames.is_empty() {
        println!("No data loaded.");
        return Ok(());
    }
    println!("{:<10} {:<28} {:>8}  {:<32} {:<32}", "Symbol", "Name", "Rows", "First", "Last");
    println!("{}", "-".repeat(114));
    for (symbol, frame) in &frames {
        println!(
            "{:<10} {:<28} {:>8}  {:<32} {:<32}",
            symbol,
            names.get(symbol).map(String::as_str).unwrap_or("-"),
            frame.len(),
            frame.min_timestamp().map(format_timestamp).unwrap_or_default(),
            frame.max_timestamp().map(format_timestamp).unwrap_or_default(),
        );
    }
    Ok(())
}

async fn run_backfill(
    config: PathBuf,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<()> {
    let config = load_config(&config)?;
    let pipelines = build_pipelines(&config)?;
    let window = (start.is_some() || end.is_some()).then(|| {
        let configured = config.window();
        FetchWindow::new(start.or(configured.start), end.or(configured.end))
    });

    let outcomes = backfill_all(&pipelines, window).await;
    let attempted = pipelines.len();
    close_all(pipelines).await?;

    for (symbol, outcome) in &outcomes {
        println!("{symbol}: {} rows", outcome.rows_written());
    }
    if outcomes.len() < attempted {
        anyhow::bail!("{} of {attempted} symbol(s) failed to backfill", attempted - outcomes.len());
    }
    Ok(())
}

async fn run_query(
    store: &StoreArgs,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    json: bool,
) -> Result<()> {
    let chunks = store.open()?;
    let frame = chunks.read_range(start, end).await?;
    chunks.close().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&frame)?);
    } else if frame.is_empty() {
        eprintln!("No rows in range.");
    } else {
        print!("{}", encode(&frame)?);
    }
    Ok(())
}

async fn run_clean(store: &StoreArgs, days: u32) -> Result<()> {
    let chunks = store.open()?;
    let summary = chunks.retention_cleanup(days).await?;
    chunks.close().await?;

    if summary.deleted.is_empty() {
        println!("No chunks older than {days} days.");
    } else {
        println!(
            "Removed {} chunk(s); {} remaining.",
            summary.deleted.len(),
            summary.remaining
        );
    }
    Ok(())
}

async fn run_status(store: &StoreArgs, json: bool) -> Result<()> {
    let chunks = store.open()?;
    let status = chunks.status().await?;
    chunks.close().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    if status.is_empty() {
        println!("Store is empty: {}", store.base_path);
        return Ok(());
    }

    let total: usize = status.iter().map(|c| c.rows).sum();
    println!("Store: {}", store.base_path);
    println!("Chunks: {}  Rows: {total}", status.len());
    println!();
    println!("{:<6} {:>8}  {:<32} {:<32}", "Chunk", "Rows", "First", "Last");
    println!("{}", "-".repeat(80));
    for c in &status {
        println!(
            "{:<6} {:>8}  {:<32} {:<32}",
            c.index,
            c.rows,
            c.first.map(format_timestamp).unwrap_or_default(),
            c.last.map(format_timestamp).unwrap_or_default(),
        );
    }
    Ok(())
}

async fn run_prepare(
    config: PathBuf,
    field: String,
    frequency: Frequency,
    days: Option<u32>,
    read_only: bool,
    threads: Option<usize>,
) -> Result<()> {
    let config = load_config(&config)?;
    let pipelines = build_pipelines(&config)?;
    let frames = refresh_all(&pipelines, RefreshOptions { n_days: days, read_only }).await;
    close_all(pipelines).await?;

    let matrix = prepare_matrix(frames, field, frequency, threads).await?;
    print_matrix(&matrix);
    Ok(())
}

fn print_matrix(matrix: &AlignedMatrix) {
    let symbols: Vec<&str> = matrix.symbols().collect();
    println!("date,{}", symbols.join(","));
    for (i, ts) in matrix.index.iter().enumerate() {
        let values: Vec<String> = matrix
            .columns
            .values()
            .map(|col| col[i].to_string())
            .collect();
        println!("{},{}", format_timestamp(*ts), values.join(","));
    }
}
