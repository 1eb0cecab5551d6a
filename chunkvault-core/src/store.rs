//! ChunkStore: the chunked time-series engine.
//!
//! A series is a run of chunk files `chunk0.csv`, `chunk1.csv`, ... with
//! contiguous indices. Each chunk holds at most `chunk_size` rows sorted by
//! timestamp; chunk `i + 1` only exists if chunk `i` does.
//!
//! Two write paths:
//! - [`ChunkStore::full_rewrite`] reads every chunk, merges, dedups exact
//!   rows and lays the whole series out again. Correct for any input order.
//! - [`ChunkStore::incremental_append`] reads only the last chunk and
//!   appends rows strictly newer than its tail. Cost is independent of
//!   history length.
//!
//! Reads never fail on missing or corrupt chunks; they degrade to an empty
//! frame with a warning. A lock timeout is the one read failure that is
//! returned, so a busy chunk is never mistaken for an empty one.

use crate::config::{ConfigError, PipelineConfig, StorageType};
use crate::data::{decode, encode, CodecError, Frame};
use crate::lock::{FileLock, LockGuard};
use crate::storage::{ChunkBackend, LocalBackend, ObjectBackend};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

pub use crate::storage::StoreError;

/// Result of a full rewrite.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RewriteSummary {
    /// Rows in the series after the rewrite.
    pub total_rows: usize,
    /// Chunks in the series after the rewrite.
    pub chunk_count: u64,
    /// Trailing chunks deleted because the series got shorter.
    pub removed_chunks: u64,
}

/// Result of an incremental append.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AppendSummary {
    pub appended_rows: usize,
    /// Chunk indices written, in order. Empty when nothing was new.
    pub chunks_written: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionSummary {
    /// Original indices of the chunks that were deleted.
    pub deleted: Vec<u64>,
    /// Chunks remaining, renumbered from 0.
    pub remaining: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkStatus {
    pub index: u64,
    pub location: String,
    pub rows: usize,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CloseReport {
    pub locks_removed: usize,
}

#[derive(Debug)]
pub struct ChunkStore {
    config: PipelineConfig,
    backend: Box<dyn ChunkBackend>,
    lock: Option<FileLock>,
}

impl ChunkStore {
    /// Validate `config` and open the backend it names.
    pub fn open(config: PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let backend: Box<dyn ChunkBackend> = match config.storage_type {
            StorageType::Local => Box::new(LocalBackend::open(&config.base_path)?),
            StorageType::Object => {
                let bucket = config
                    .bucket_name
                    .as_deref()
                    .ok_or(ConfigError::MissingBucket)?;
                Box::new(ObjectBackend::from_bucket(bucket, &config.base_path)?)
            }
        };
        Self::with_backend(config, backend)
    }

    /// Use a caller-supplied backend. `config.storage_type` must match it.
    pub fn with_backend(
        config: PipelineConfig,
        backend: Box<dyn ChunkBackend>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if backend.kind() != config.storage_type {
            return Err(ConfigError::Invalid(format!(
                "backend is {} but config says {}",
                backend.kind(),
                config.storage_type
            )));
        }
        let lock = (config.locking_enabled() && backend.supports_locking())
            .then(|| FileLock::new(config.lock));
        Ok(Self {
            config,
            backend,
            lock,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    pub fn locking_enabled(&self) -> bool {
        self.lock.is_some()
    }

    pub fn location(&self, index: u64) -> String {
        self.backend.location(index)
    }

    async fn acquire(&self, index: u64) -> Result<Option<LockGuard>, StoreError> {
        match (&self.lock, self.backend.lock_target(index)) {
            (Some(lock), Some(target)) => Ok(Some(lock.acquire(&target).await?)),
            _ => Ok(None),
        }
    }

    async fn release(guard: Option<LockGuard>) -> Result<(), StoreError> {
        if let Some(guard) = guard {
            guard.release().await?;
        }
        Ok(())
    }

    // ── single chunk operations ──────────────────────────────────────

    /// Read chunk `index`. Absent, empty and unparseable chunks read as an
    /// empty frame.
    pub async fn read_chunk(&self, index: u64) -> Result<Frame, StoreError> {
        let guard = self.acquire(index).await?;
        let read = self.backend.read(index).await;
        if let Err(e) = Self::release(guard).await {
            warn!(chunk = index, error = %e, "failed to release read lock");
        }

        let location = self.backend.location(index);
        match read {
            Ok(None) => {
                debug!(%location, "chunk absent");
                Ok(Frame::new())
            }
            Ok(Some(text)) => match decode(&text) {
                Ok(frame) => Ok(frame),
                Err(CodecError::Empty) => {
                    warn!(%location, "chunk is empty");
                    Ok(Frame::new())
                }
                Err(e) => {
                    warn!(%location, error = %e, "chunk is unreadable, treating as empty");
                    Ok(Frame::new())
                }
            },
            Err(e) => {
                warn!(%location, error = %e, "chunk read failed, treating as empty");
                Ok(Frame::new())
            }
        }
    }

    pub async fn chunk_exists(&self, index: u64) -> Result<bool, StoreError> {
        self.backend.exists(index).await
    }

    /// Replace chunk `index` with `frame`.
    pub async fn write_chunk(&self, index: u64, frame: &Frame) -> Result<(), StoreError> {
        let contents = encode(frame)?;
        let guard = self.acquire(index).await?;
        let existed = self.backend.exists(index).await?;
        self.backend.write(index, contents).await?;
        Self::release(guard).await?;

        let location = self.backend.location(index);
        if existed {
            info!(%location, rows = frame.len(), "updated chunk");
        } else {
            info!(%location, rows = frame.len(), "created chunk");
        }
        Ok(())
    }

    pub async fn delete_chunk(&self, index: u64) -> Result<(), StoreError> {
        let guard = self.acquire(index).await?;
        self.backend.delete(index).await?;
        Self::release(guard).await?;
        info!(location = %self.backend.location(index), "removed chunk");
        Ok(())
    }

    async fn move_chunk(&self, from: u64, to: u64) -> Result<(), StoreError> {
        let src = self.acquire(from).await?;
        let dst = self.acquire(to).await?;
        self.backend.rename(from, to).await?;
        Self::release(dst).await?;
        Self::release(src).await?;
        debug!(from, to, "renumbered chunk");
        Ok(())
    }

    /// Number of contiguous chunks starting at 0.
    pub async fn chunk_count(&self) -> Result<u64, StoreError> {
        let mut n = 0;
        while self.backend.exists(n).await? {
            n += 1;
        }
        Ok(n)
    }

    /// Index of the last chunk, or `None` for an empty store.
    pub async fn last_chunk_index(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.chunk_count().await?.checked_sub(1))
    }

    // ── write paths ──────────────────────────────────────────────────

    /// Merge `new_rows` into the whole series and lay it out again.
    ///
    /// Duplicates are exact rows (timestamp and every field). Two rows with
    /// the same timestamp but different values both survive.
    #[instrument(skip_all, fields(base_path = %self.config.base_path, new_rows = new_rows.len()))]
    pub async fn full_rewrite(&self, new_rows: Frame) -> Result<RewriteSummary, StoreError> {
        if new_rows.is_empty() {
            debug!("nothing to rewrite");
            return Ok(RewriteSummary::default());
        }

        let mut new_rows = new_rows;
        new_rows.truncate_to_micros();

        let existing = self.chunk_count().await?;
        let mut all = Frame::new();
        for i in 0..existing {
            all.extend(self.read_chunk(i).await?);
        }
        all.extend(new_rows);
        all.dedup_exact();
        all.sort_by_timestamp();

        let size = self.chunk_size();
        let mut written = 0u64;
        for chunk in all.chunks(size) {
            self.write_chunk(written, &chunk).await?;
            written += 1;
        }

        let mut removed = 0;
        for i in written..existing {
            self.delete_chunk(i).await?;
            removed += 1;
        }

        let summary = RewriteSummary {
            total_rows: all.len(),
            chunk_count: written,
            removed_chunks: removed,
        };
        info!(?summary, "full rewrite complete");
        Ok(summary)
    }

    /// Append rows newer than the current tail, touching only the last
    /// chunk and any new chunks after it.
    #[instrument(skip_all, fields(base_path = %self.config.base_path, new_rows = new_rows.len()))]
    pub async fn incremental_append(&self, new_rows: Frame) -> Result<AppendSummary, StoreError> {
        if new_rows.is_empty() {
            debug!("nothing to append");
            return Ok(AppendSummary::default());
        }

        let (start_index, mut tail) = match self.last_chunk_index().await? {
            Some(i) => (i, self.read_chunk(i).await?),
            None => (0, Frame::new()),
        };

        let mut incoming = new_rows;
        incoming.truncate_to_micros();
        if let Some(tail_max) = tail.max_timestamp() {
            incoming.retain_after(tail_max);
        }
        if incoming.is_empty() {
            debug!("no rows newer than the stored tail");
            return Ok(AppendSummary::default());
        }

        let appended_rows = incoming.len();
        tail.extend(incoming);
        tail.sort_by_timestamp();

        let mut chunks_written = Vec::new();
        for (offset, chunk) in tail.chunks(self.chunk_size()).enumerate() {
            let index = start_index + offset as u64;
            self.write_chunk(index, &chunk).await?;
            chunks_written.push(index);
        }

        info!(appended_rows, chunks = ?chunks_written, "incremental append complete");
        Ok(AppendSummary {
            appended_rows,
            chunks_written,
        })
    }

    // ── read paths ───────────────────────────────────────────────────

    /// Every row with `start <= timestamp <= end`, sorted, one row per
    /// timestamp (the last one written wins).
    pub async fn read_range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Frame, StoreError> {
        let count = self.chunk_count().await?;
        let mut all = Frame::new();
        for i in 0..count {
            all.extend(self.read_chunk(i).await?);
        }
        all.sort_by_timestamp();
        all.dedup_by_timestamp_keep_last();
        all.filter_range(start, end);
        Ok(all)
    }

    pub async fn read_all(&self) -> Result<Frame, StoreError> {
        self.read_range(None, None).await
    }

    /// Rows from the last `days` days up to now.
    pub async fn latest_n_days(&self, days: u32) -> Result<Frame, StoreError> {
        let start = Utc::now() - Duration::days(i64::from(days));
        self.read_range(Some(start), None).await
    }

    /// The cached window: the last `cache_days` days.
    pub async fn load_cache(&self) -> Result<Frame, StoreError> {
        self.latest_n_days(self.config.cache_days).await
    }

    /// Maximum timestamp of the last chunk.
    pub async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        match self.last_chunk_index().await? {
            Some(i) => Ok(self.read_chunk(i).await?.max_timestamp()),
            None => Ok(None),
        }
    }

    pub async fn status(&self) -> Result<Vec<ChunkStatus>, StoreError> {
        let count = self.chunk_count().await?;
        let mut out = Vec::with_capacity(count as usize);
        for index in 0..count {
            let frame = self.read_chunk(index).await?;
            out.push(ChunkStatus {
                index,
                location: self.backend.location(index),
                rows: frame.len(),
                first: frame.min_timestamp(),
                last: frame.max_timestamp(),
            });
        }
        Ok(out)
    }

    // ── retention ────────────────────────────────────────────────────

    /// Delete whole chunks whose newest row is older than `days` ago.
    pub async fn retention_cleanup(&self, days: u32) -> Result<RetentionSummary, StoreError> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        self.retention_cleanup_before(cutoff).await
    }

    /// Delete whole chunks whose newest row is before `cutoff`, then shift
    /// the survivors down so indices stay contiguous from 0. Empty chunks
    /// have no newest row and are kept.
    #[instrument(skip_all, fields(base_path = %self.config.base_path, %cutoff))]
    pub async fn retention_cleanup_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<RetentionSummary, StoreError> {
        let count = self.chunk_count().await?;
        let mut deleted = Vec::new();
        let mut survivors = Vec::new();

        for i in 0..count {
            let frame = self.read_chunk(i).await?;
            match frame.max_timestamp() {
                Some(max) if max < cutoff => {
                    self.delete_chunk(i).await?;
                    deleted.push(i);
                }
                _ => survivors.push(i),
            }
        }

        for (new_index, &old_index) in survivors.iter().enumerate() {
            let new_index = new_index as u64;
            if new_index != old_index {
                self.move_chunk(old_index, new_index).await?;
            }
        }

        if !deleted.is_empty() {
            info!(deleted = deleted.len(), remaining = survivors.len(), "retention cleanup");
        }
        Ok(RetentionSummary {
            deleted,
            remaining: survivors.len() as u64,
        })
    }

    // ── lifecycle ────────────────────────────────────────────────────

    /// Close the backend and, with local locking on, remove stale
    /// sentinels. Both steps run; the first failure is returned.
    pub async fn close(&self) -> Result<CloseReport, StoreError> {
        let closed = self.backend.close().await;

        let mut report = CloseReport::default();
        let swept = if self.lock.is_some() {
            self.backend.sweep_locks().await.map(|n| {
                report.locks_removed = n;
            })
        } else {
            Ok(())
        };

        if report.locks_removed > 0 {
            warn!(count = report.locks_removed, "removed leftover lock sentinels");
        }
        closed?;
        swept?;
        Ok(report)
    }
}
