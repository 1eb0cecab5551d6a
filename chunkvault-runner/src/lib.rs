//! chunkvault runner: many symbols, one configuration.
//!
//! This crate builds on `chunkvault-core` to provide:
//! - TOML run configuration with a shared provider and storage layout
//! - One pipeline per symbol, rooted at `{base_path}/{symbol}`
//! - Concurrent poll loops with a shared stop signal and orderly teardown
//! - Batch refresh (catch-up then load) and batch backfill
//! - Cross-symbol alignment of one field on a rayon worker pool

pub mod config;
pub mod prepare;
pub mod runner;

pub use config::{DataPipelinesConfig, RunnerConfig, RunnerError, StockEntry};
pub use prepare::{align, prepare_matrix, AlignedMatrix, Frequency, PrepareError};
pub use runner::{
    backfill_all, build_pipelines, close_all, refresh_all, run_realtime, RealtimeReport,
    RefreshOptions,
};
