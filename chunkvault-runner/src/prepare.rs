//! Cross-symbol alignment: one numeric field per symbol on a shared,
//! regularly spaced time index.
//!
//! Steps:
//! 1. Extract the field from every symbol's frame (parallel, rayon pool)
//! 2. Bucket each series to the target frequency, keeping the last value
//! 3. Lay every series on the full bucket grid (outer join)
//! 4. Back-fill, then forward-fill the gaps
//!
//! The work is CPU bound, so the async entry point hands it to a blocking
//! thread and the runtime keeps polling other pipelines meanwhile.

use chrono::{DateTime, Duration, DurationRound, Utc};
use chunkvault_core::Frame;
use polars::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("no symbol has usable '{field}' data")]
    NoData { field: String },

    #[error("unknown frequency '{0}' (expected minute, hour or day)")]
    UnknownFrequency(String),

    #[error("grid of {buckets} buckets is too large")]
    GridTooLarge { buckets: i64 },

    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("polars: {0}")]
    Polars(#[from] PolarsError),
}

/// Upper bound on grid rows, e.g. ten years of minutes is ~5.3M.
const MAX_BUCKETS: i64 = 10_000_000;

/// Resampling frequency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Minute,
    Hour,
    #[default]
    Day,
}

impl Frequency {
    pub fn step(&self) -> Duration {
        match self {
            Frequency::Minute => Duration::minutes(1),
            Frequency::Hour => Duration::hours(1),
            Frequency::Day => Duration::days(1),
        }
    }

    /// Start of the bucket containing `ts`.
    pub fn bucket(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        ts.duration_trunc(self.step()).unwrap_or(ts)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Minute => "minute",
            Frequency::Hour => "hour",
            Frequency::Day => "day",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = PrepareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minute" | "min" | "1min" | "1m" | "t" => Ok(Frequency::Minute),
            "hour" | "1h" | "h" => Ok(Frequency::Hour),
            "day" | "1d" | "d" => Ok(Frequency::Day),
            other => Err(PrepareError::UnknownFrequency(other.to_string())),
        }
    }
}

/// Aligned values: `columns[symbol][i]` is the value at `index[i]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignedMatrix {
    pub field: String,
    pub frequency: Frequency,
    pub index: Vec<DateTime<Utc>>,
    pub columns: BTreeMap<String, Vec<f64>>,
}

impl AlignedMatrix {
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// `date` as `Datetime(µs)` plus one Float64 column per symbol.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let micros: Vec<i64> = self.index.iter().map(|t| t.timestamp_micros()).collect();
        let mut columns = vec![Column::new("date".into(), micros)
            .cast(&DataType::Datetime(TimeUnit::Microseconds, None))?];
        for (symbol, values) in &self.columns {
            columns.push(Column::new(symbol.as_str().into(), values.as_slice()));
        }
        DataFrame::new(columns)
    }
}

/// Align `field` across `frames` at `frequency` on a dedicated worker pool.
///
/// `threads` caps the pool; `None` lets rayon pick.
pub async fn prepare_matrix(
    frames: BTreeMap<String, Frame>,
    field: impl Into<String>,
    frequency: Frequency,
    threads: Option<usize>,
) -> Result<AlignedMatrix, PrepareError> {
    let field = field.into();
    tokio::task::spawn_blocking(move || {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(n) = threads {
            builder = builder.num_threads(n);
        }
        let pool = builder.build()?;
        pool.install(|| align(&frames, &field, frequency))
    })
    .await?
}

/// Synchronous alignment; runs on whatever rayon pool is current.
pub fn align(
    frames: &BTreeMap<String, Frame>,
    field: &str,
    frequency: Frequency,
) -> Result<AlignedMatrix, PrepareError> {
    let started = Instant::now();
    info!(%field, %frequency, symbols = frames.len(), "preparing aligned matrix");

    let series: Vec<(String, BTreeMap<DateTime<Utc>, f64>)> = frames
        .par_iter()
        .filter_map(|(symbol, frame)| {
            let buckets = bucket_last(frame, field, frequency);
            if buckets.is_empty() {
                warn!(%symbol, %field, "no usable values, skipping symbol");
                None
            } else {
                Some((symbol.clone(), buckets))
            }
        })
        .collect();

    let (Some(first), Some(last)) = (
        series.iter().filter_map(|(_, s)| s.keys().next()).min().copied(),
        series.iter().filter_map(|(_, s)| s.keys().next_back()).max().copied(),
    ) else {
        return Err(PrepareError::NoData {
            field: field.to_string(),
        });
    };

    let step = frequency.step();
    let buckets = (last - first).num_seconds() / step.num_seconds() + 1;
    if buckets > MAX_BUCKETS {
        return Err(PrepareError::GridTooLarge { buckets });
    }
    let index: Vec<DateTime<Utc>> = (0..buckets).map(|i| first + step * i as i32).collect();

    let columns: BTreeMap<String, Vec<f64>> = series
        .into_par_iter()
        .map(|(symbol, values)| {
            let sparse: Vec<Option<f64>> = index.iter().map(|t| values.get(t).copied()).collect();
            (symbol, fill_gaps(sparse))
        })
        .collect();

    info!(
        rows = index.len(),
        columns = columns.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "aligned matrix prepared"
    );
    Ok(AlignedMatrix {
        field: field.to_string(),
        frequency,
        index,
        columns,
    })
}

/// Bucketed series of one field: the last non-missing value per bucket.
fn bucket_last(frame: &Frame, field: &str, frequency: Frequency) -> BTreeMap<DateTime<Utc>, f64> {
    let mut points: Vec<(DateTime<Utc>, f64)> = frame
        .rows()
        .iter()
        .filter_map(|r| r.number(field).filter(|v| !v.is_nan()).map(|v| (r.timestamp, v)))
        .collect();
    points.sort_by_key(|(ts, _)| *ts);

    let mut out = BTreeMap::new();
    for (ts, value) in points {
        out.insert(frequency.bucket(ts), value);
    }
    out
}

/// Back-fill then forward-fill. A column with at least one value comes out
/// with no gaps.
fn fill_gaps(mut values: Vec<Option<f64>>) -> Vec<f64> {
    let mut next = None;
    for v in values.iter_mut().rev() {
        match v {
            Some(x) => next = Some(*x),
            None => *v = next,
        }
    }
    let mut prev = f64::NAN;
    values
        .into_iter()
        .map(|v| {
            if let Some(x) = v {
                prev = x;
            }
            prev
        })
        .collect()
}
