//! CSV file provider: replays a local file in the chunk format.
//!
//! Used for offline imports and as the fallback when the network source is
//! unavailable. The file is re-read on every fetch so it can be appended to
//! by an outside process.

use super::{DataProvider, FetchWindow, ProviderError};
use crate::data::{decode, Frame};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub struct CsvFileProvider {
    path: PathBuf,
    symbol: String,
    window: FetchWindow,
}

impl CsvFileProvider {
    pub fn new(path: impl Into<PathBuf>, symbol: impl Into<String>, window: FetchWindow) -> Self {
        Self {
            path: path.into(),
            symbol: symbol.into(),
            window,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DataProvider for CsvFileProvider {
    fn name(&self) -> &str {
        "csv_file"
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
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ProviderError::Source {
                path: self.path.clone(),
                source,
            })?;
        if text.trim().is_empty() {
            return Ok(Frame::new());
        }

        let mut frame = decode(&text)?;
        frame.filter_range(self.window.start, self.window.end);
        frame.sort_by_timestamp();
        Ok(frame)
    }

    async fn ping(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }
}
