//! Data provider trait and structured error types.
//!
//! A provider owns a mutable fetch window and returns the rows for it. The
//! orchestrator moves the window; providers never know about chunks.

pub mod circuit_breaker;
pub mod csv_file;
pub mod memory;
pub mod registry;
pub mod yahoo;

pub use circuit_breaker::CircuitBreaker;
pub use csv_file::CsvFileProvider;
pub use memory::{MemoryFeed, MemoryProvider};
pub use registry::{ProviderKind, ProviderSpec};
pub use yahoo::{Interval, YahooProvider};

use crate::data::{CodecError, Frame};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Structured error types for provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("hard stop: data provider has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("failed to read {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("source data: {0}")]
    Codec(#[from] CodecError),

    #[error("provider error: {0}")]
    Other(String),
}

/// The date window a provider fetches. An unset bound is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl FetchWindow {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Inclusive on both ends.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts <= e)
    }

    /// True when both bounds are set and start is after end.
    pub fn is_inverted(&self) -> bool {
        matches!((self.start, self.end), (Some(s), Some(e)) if s > e)
    }
}

/// Source of rows for one series.
///
/// Implementations handle the specifics of one data source. Storage sits
/// above this trait.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Registry name of this provider, e.g. `yahoo_finance`.
    fn name(&self) -> &str;

    /// The series this provider serves.
    fn symbol(&self) -> &str;

    fn window(&self) -> FetchWindow;

    fn window_mut(&mut self) -> &mut FetchWindow;

    /// Rows for the current window. An empty frame means "nothing there".
    async fn fetch(&self) -> Result<Frame, ProviderError>;

    /// Cheap liveness check.
    async fn ping(&self) -> bool;

    /// Release held resources.
    async fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
