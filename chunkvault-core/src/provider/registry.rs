//! Compile-time provider registry: each [`ProviderKind`] maps to one
//! constructor function.

use super::{
    CircuitBreaker, CsvFileProvider, DataProvider, FetchWindow, Interval, ProviderError,
    YahooProvider,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

pub type ProviderConstructor = fn(&ProviderSpec) -> Result<Box<dyn DataProvider>, ProviderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    YahooFinance,
    CsvFile,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::YahooFinance, ProviderKind::CsvFile];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::YahooFinance => "yahoo_finance",
            ProviderKind::CsvFile => "csv_file",
        }
    }

    pub fn constructor(&self) -> ProviderConstructor {
        match self {
            ProviderKind::YahooFinance => build_yahoo,
            ProviderKind::CsvFile => build_csv_file,
        }
    }

    pub fn build(&self, spec: &ProviderSpec) -> Result<Box<dyn DataProvider>, ProviderError> {
        (self.constructor())(spec)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s.trim())
            .ok_or_else(|| ProviderError::Other(format!("unknown provider '{s}'")))
    }
}

/// Everything a constructor may need. Fields a provider does not use are
/// ignored.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub symbol: String,
    pub window: FetchWindow,
    pub interval: Interval,
    /// Yahoo `range` used when the window is unbounded, e.g. `1mo`.
    pub period: String,
    /// Source file for `csv_file`.
    pub source: Option<PathBuf>,
    /// Shared breaker so every Yahoo pipeline backs off together.
    pub circuit_breaker: Option<Arc<CircuitBreaker>>,
}

impl ProviderSpec {
    pub fn new(symbol: impl Into<String>, window: FetchWindow) -> Self {
        Self {
            symbol: symbol.into(),
            window,
            interval: Interval::default(),
            period: "1mo".into(),
            source: None,
            circuit_breaker: None,
        }
    }
}

fn build_yahoo(spec: &ProviderSpec) -> Result<Box<dyn DataProvider>, ProviderError> {
    let breaker = spec
        .circuit_breaker
        .clone()
        .unwrap_or_else(|| Arc::new(CircuitBreaker::default_provider()));
    Ok(Box::new(YahooProvider::new(
        spec.symbol.clone(),
        spec.interval,
        spec.period.clone(),
        spec.window,
        breaker,
    )?))
}

fn build_csv_file(spec: &ProviderSpec) -> Result<Box<dyn DataProvider>, ProviderError> {
    let path = spec
        .source
        .clone()
        .ok_or_else(|| ProviderError::Other(format!("csv_file provider for {} needs a source path", spec.symbol)))?;
    Ok(Box::new(CsvFileProvider::new(path, spec.symbol.clone(), spec.window)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_through_names() {
        for kind in ProviderKind::ALL {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
        }
        assert!("alpha_vantage".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn csv_file_requires_source() {
        let spec = ProviderSpec::new("SPY", FetchWindow::unbounded());
        assert!(ProviderKind::CsvFile.build(&spec).is_err());

        let mut spec = spec;
        spec.source = Some(PathBuf::from("spy.csv"));
        let provider = ProviderKind::CsvFile.build(&spec).unwrap();
        assert_eq!(provider.name(), "csv_file");
        assert_eq!(provider.symbol(), "SPY");
    }

    #[test]
    fn yahoo_constructor_builds_provider() {
        let spec = ProviderSpec::new("QQQ", FetchWindow::unbounded());
        let provider = ProviderKind::YahooFinance.build(&spec).unwrap();
        assert_eq!(provider.name(), "yahoo_finance");
    }
}
