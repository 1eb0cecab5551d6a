//! In-memory provider for tests, benchmarks and embedding.

use super::{DataProvider, FetchWindow, ProviderError};
use crate::data::{Frame, Row};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Shared handle for feeding a [`MemoryProvider`] after it has been handed
/// to a pipeline.
#[derive(Debug, Clone, Default)]
pub struct MemoryFeed {
    rows: Arc<Mutex<Vec<Row>>>,
    fetches: Arc<AtomicUsize>,
}

impl MemoryFeed {
    pub fn push(&self, row: Row) {
        self.rows.lock().unwrap_or_else(|p| p.into_inner()).push(row);
    }

    pub fn extend(&self, frame: Frame) {
        self.rows
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(frame);
    }

    /// Number of completed `fetch` calls.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct MemoryProvider {
    symbol: String,
    window: FetchWindow,
    feed: MemoryFeed,
}

impl MemoryProvider {
    pub fn new(symbol: impl Into<String>, window: FetchWindow) -> Self {
        Self {
            symbol: symbol.into(),
            window,
            feed: MemoryFeed::default(),
        }
    }

    pub fn with_rows(self, rows: Frame) -> Self {
        self.feed.extend(rows);
        self
    }

    pub fn feed(&self) -> MemoryFeed {
        self.feed.clone()
    }
}

#[async_trait]
impl DataProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn window(&self) -> FetchWindow {
        self.window
    }

    fn window_mut(&mut self) -> &mut FetchWindow {
        &mut self.window
    }

    async fn fetch(&self) -> Result<Frame, ProviderError> {
        let mut frame: Frame = {
            let rows = self.feed.rows.lock().unwrap_or_else(|p| p.into_inner());
            rows.iter()
                .filter(|r| self.window.contains(r.timestamp))
                .cloned()
                .collect()
        };
        frame.sort_by_timestamp();
        self.feed.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(frame)
    }

    async fn ping(&self) -> bool {
        true
    }
}
