//! Run configuration: one TOML file describing a set of symbols that share
//! a provider and a storage layout.
//!
//! ```toml
//! [data_pipelines]
//! provider = "yahoo_finance"
//! base_path = "data"
//! start_date = "2020-01-01"
//! end_date = "TODAY"
//! interval = "1d"
//!
//! [[data_pipelines.stocks]]
//! symbol = "SPY"
//! full_name = "SPDR S&P 500 ETF"
//! ```

use chrono::{DateTime, TimeZone, Utc};
use chunkvault_core::config::{
    DEFAULT_CACHE_DAYS, DEFAULT_CHUNK_SIZE, DEFAULT_FETCH_INTERVAL_SECS,
};
use chunkvault_core::data::codec::parse_timestamp;
use chunkvault_core::provider::Interval;
use chunkvault_core::{
    ConfigError, FetchWindow, PipelineConfig, PipelineError, ProviderError, ProviderKind,
    StorageType,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// `end_date` value meaning "up to now".
pub const END_TODAY: &str = "TODAY";

const DEFAULT_BASE_PATH: &str = "data";
const DEFAULT_PERIOD: &str = "1mo";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid run configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid {field} '{value}'")]
    InvalidDate { field: &'static str, value: String },

    #[error("no stocks configured")]
    NoStocks,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{symbol}: {source}")]
    Provider {
        symbol: String,
        #[source]
        source: ProviderError,
    },

    #[error("{symbol}: {source}")]
    Pipeline {
        symbol: String,
        #[source]
        source: PipelineError,
    },

    #[error("realtime task failed: {0}")]
    Task(String),
}

/// One symbol entry. Unset fields inherit from `[data_pipelines]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockEntry {
    pub symbol: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub interval: Option<Interval>,
    /// Source file for the `csv_file` provider, relative to the config file.
    #[serde(default)]
    pub source: Option<PathBuf>,
}

/// The `[data_pipelines]` table as written in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPipelinesConfig {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default)]
    pub storage_type: StorageType,
    #[serde(default)]
    pub bucket_name: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub interval: Interval,
    #[serde(default = "default_period")]
    pub period: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_cache_days")]
    pub cache_days: u32,
    #[serde(default = "default_use_lock")]
    pub use_lock: bool,
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval: u64,
    #[serde(default)]
    pub stocks_file: Option<PathBuf>,
    #[serde(default)]
    pub stocks: Vec<StockEntry>,
}

fn default_provider() -> ProviderKind {
    ProviderKind::YahooFinance
}

fn default_base_path() -> String {
    DEFAULT_BASE_PATH.to_string()
}

fn default_period() -> String {
    DEFAULT_PERIOD.to_string()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_cache_days() -> u32 {
    DEFAULT_CACHE_DAYS
}

fn default_use_lock() -> bool {
    true
}

fn default_fetch_interval() -> u64 {
    DEFAULT_FETCH_INTERVAL_SECS
}

#[derive(Debug, Deserialize)]
struct RawRunConfig {
    data_pipelines: DataPipelinesConfig,
}

#[derive(Debug, Deserialize)]
struct StocksFile {
    stocks: Vec<StockEntry>,
}

/// A resolved run configuration: paths are absolute or relative to the
/// process, dates are parsed and the stock list is final.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub pipelines: DataPipelinesConfig,
    /// Directory of the config file; relative sources resolve against it.
    pub config_dir: PathBuf,
    pub start: DateTime<Utc>,
    /// `None` means up to now.
    pub end: Option<DateTime<Utc>>,
}

impl RunnerConfig {
    /// Read and resolve a run configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RunnerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RunnerError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        info!(path = %path.display(), "reading run configuration");
        Self::from_toml_str(&text, config_dir).map_err(|e| match e {
            RunnerError::Parse { source, .. } => RunnerError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Resolve a configuration given its text and the directory it lives in.
    pub fn from_toml_str(text: &str, config_dir: impl Into<PathBuf>) -> Result<Self, RunnerError> {
        let config_dir = config_dir.into();
        let raw: RawRunConfig = toml::from_str(text).map_err(|source| RunnerError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        let mut pipelines = raw.data_pipelines;

        let start = match pipelines.start_date.as_deref() {
            Some(value) => parse_date("start_date", value)?,
            None => epoch(),
        };
        let end = match pipelines.end_date.as_deref() {
            None => None,
            Some(value) if value.trim().eq_ignore_ascii_case(END_TODAY) => None,
            Some(value) => Some(parse_date("end_date", value)?),
        };

        if pipelines.storage_type == StorageType::Local {
            let base = Path::new(&pipelines.base_path);
            if base.is_relative() {
                pipelines.base_path = config_dir.join(base).to_string_lossy().into_owned();
            }
        } else if pipelines.bucket_name.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::MissingBucket.into());
        }

        if let Some(stocks_file) = pipelines.stocks_file.clone() {
            match load_stocks_file(&config_dir.join(&stocks_file)) {
                Some(stocks) => pipelines.stocks = stocks,
                None => warn!(
                    file = %stocks_file.display(),
                    "stocks file unusable, using stocks from the main config"
                ),
            }
        }

        Ok(Self {
            pipelines,
            config_dir,
            start,
            end,
        })
    }

    pub fn stocks(&self) -> &[StockEntry] {
        &self.pipelines.stocks
    }

    /// The configured fetch window shared by every symbol.
    pub fn window(&self) -> FetchWindow {
        FetchWindow::new(Some(self.start), self.end)
    }

    /// Symbol to full name, for symbols that have one.
    pub fn symbol_mapper(&self) -> BTreeMap<String, String> {
        self.pipelines
            .stocks
            .iter()
            .filter_map(|s| s.full_name.clone().map(|name| (s.symbol.clone(), name)))
            .collect()
    }

    /// Store configuration for one symbol, rooted at `{base_path}/{symbol}`.
    pub fn pipeline_config(&self, symbol: &str) -> PipelineConfig {
        let p = &self.pipelines;
        let base_path = match p.storage_type {
            StorageType::Local => Path::new(&p.base_path).join(symbol).to_string_lossy().into_owned(),
            StorageType::Object => format!("{}/{symbol}", p.base_path.trim_end_matches('/')),
        };
        let mut config = PipelineConfig::new(base_path)
            .with_chunk_size(p.chunk_size)
            .with_cache_days(p.cache_days)
            .with_lock(p.use_lock)
            .with_fetch_interval(p.fetch_interval);
        if p.storage_type == StorageType::Object {
            config = config.with_object_storage(p.bucket_name.clone().unwrap_or_default());
        }
        config
    }

    /// Resolve a stock's source file against the config directory.
    pub fn source_path(&self, stock: &StockEntry) -> Option<PathBuf> {
        stock.source.as_ref().map(|s| {
            if s.is_relative() {
                self.config_dir.join(s)
            } else {
                s.clone()
            }
        })
    }
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}

fn parse_date(field: &'static str, value: &str) -> Result<DateTime<Utc>, RunnerError> {
    parse_timestamp(value).ok_or_else(|| RunnerError::InvalidDate {
        field,
        value: value.to_string(),
    })
}

fn load_stocks_file(path: &Path) -> Option<Vec<StockEntry>> {
    let text = std::fs::read_to_string(path).ok()?;
    let parsed: StocksFile = toml::from_str(&text).ok()?;
    Some(parsed.stocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
[data_pipelines]
provider = "csv_file"
base_path = "store"
start_date = "2024-01-01"
end_date = "2024-06-30"
chunk_size = 500

[[data_pipelines.stocks]]
symbol = "SPY"
full_name = "SPDR S&P 500 ETF"
source = "feeds/spy.csv"

[[data_pipelines.stocks]]
symbol = "QQQ"
interval = "1h"
"#;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg = RunnerConfig::from_toml_str("[data_pipelines]\n", "/srv/app").unwrap();
        let p = &cfg.pipelines;
        assert_eq!(p.provider, ProviderKind::YahooFinance);
        assert_eq!(p.chunk_size, 10_000);
        assert_eq!(p.cache_days, 7);
        assert_eq!(p.fetch_interval, 60);
        assert!(p.use_lock);
        assert_eq!(p.interval, Interval::OneDay);
        assert_eq!(p.period, "1mo");
        assert_eq!(cfg.start, epoch());
        assert_eq!(cfg.end, None);
        assert_eq!(Path::new(&p.base_path), Path::new("/srv/app/data"));
    }

    #[test]
    fn dates_and_stocks_parse() {
        let cfg = RunnerConfig::from_toml_str(BASIC, "/srv/app").unwrap();
        assert_eq!(cfg.start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(cfg.end, Some(Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap()));
        assert_eq!(cfg.stocks().len(), 2);
        assert_eq!(cfg.stocks()[1].interval, Some(Interval::OneHour));
        assert_eq!(
            cfg.source_path(&cfg.stocks()[0]),
            Some(PathBuf::from("/srv/app/feeds/spy.csv"))
        );
    }

    #[test]
    fn today_means_open_ended() {
        let text = "[data_pipelines]\nend_date = \"TODAY\"\n";
        let cfg = RunnerConfig::from_toml_str(text, ".").unwrap();
        assert_eq!(cfg.end, None);
        assert!(cfg.window().end.is_none());
    }

    #[test]
    fn bad_date_is_rejected() {
        let text = "[data_pipelines]\nstart_date = \"yesterday\"\n";
        assert!(matches!(
            RunnerConfig::from_toml_str(text, "."),
            Err(RunnerError::InvalidDate { field: "start_date", .. })
        ));
    }

    #[test]
    fn object_storage_requires_bucket() {
        let text = "[data_pipelines]\nstorage_type = \"gcs\"\nbase_path = \"prices\"\n";
        assert!(matches!(
            RunnerConfig::from_toml_str(text, "."),
            Err(RunnerError::Config(ConfigError::MissingBucket))
        ));
    }

    #[test]
    fn object_base_path_is_kept_verbatim() {
        let text = "[data_pipelines]\nstorage_type = \"object\"\nbucket_name = \"b\"\nbase_path = \"prices/\"\n";
        let cfg = RunnerConfig::from_toml_str(text, "/srv/app").unwrap();
        let pc = cfg.pipeline_config("SPY");
        assert_eq!(pc.base_path, "prices/SPY");
        assert_eq!(pc.storage_type, StorageType::Object);
        assert_eq!(pc.bucket_name.as_deref(), Some("b"));
    }

    #[test]
    fn pipeline_config_nests_symbol_under_base() {
        let cfg = RunnerConfig::from_toml_str(BASIC, "/srv/app").unwrap();
        let pc = cfg.pipeline_config("SPY");
        assert_eq!(Path::new(&pc.base_path), Path::new("/srv/app/store/SPY"));
        assert_eq!(pc.chunk_size, 500);
        assert!(pc.use_lock);
    }

    #[test]
    fn symbol_mapper_skips_unnamed() {
        let cfg = RunnerConfig::from_toml_str(BASIC, ".").unwrap();
        let mapper = cfg.symbol_mapper();
        assert_eq!(mapper.len(), 1);
        assert_eq!(mapper["SPY"], "SPDR S&P 500 ETF");
    }

    #[test]
    fn stocks_file_replaces_inline_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("stocks.toml"),
            "[[stocks]]\nsymbol = \"IWM\"\n\n[[stocks]]\nsymbol = \"DIA\"\n",
        )
        .unwrap();
        let text = format!("{BASIC}\n").replace(
            "chunk_size = 500",
            "chunk_size = 500\nstocks_file = \"stocks.toml\"",
        );
        let cfg = RunnerConfig::from_toml_str(&text, dir.path()).unwrap();
        let symbols: Vec<_> = cfg.stocks().iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["IWM", "DIA"]);
    }

    #[test]
    fn missing_stocks_file_falls_back() {
        let text = BASIC.replace(
            "chunk_size = 500",
            "chunk_size = 500\nstocks_file = \"nope.toml\"",
        );
        let cfg = RunnerConfig::from_toml_str(&text, "/nonexistent").unwrap();
        assert_eq!(cfg.stocks().len(), 2);
    }
}
