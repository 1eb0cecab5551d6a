//! Yahoo Finance data provider.
//!
//! Fetches OHLCV bars from Yahoo's v8 chart API. Handles rate limiting,
//! retries with exponential backoff, response parsing, and the circuit breaker.
//!
//! Yahoo Finance has no official API and is subject to unannounced format changes.
//! The CSV file provider is the fallback when Yahoo is unavailable.

use super::circuit_breaker::CircuitBreaker;
use super::{DataProvider, FetchWindow, ProviderError};
use crate::data::{Frame, Row};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const CHART_URL: &str = "https://query2.finance.yahoo.com/v8/finance/chart";

/// Yahoo keeps one-minute bars for about a week.
const ONE_MINUTE_HISTORY_DAYS: i64 = 7;

/// Exchange-local session close used when the response has no regular
/// trading period.
const DEFAULT_SESSION_CLOSE: (u32, u32) = (16, 0);

/// Bar interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[default]
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1wk")]
    OneWeek,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::FiveMinutes => "5m",
            Interval::OneHour => "1h",
            Interval::OneDay => "1d",
            Interval::OneWeek => "1wk",
        }
    }

    /// Daily and weekly bars are stamped at the session close.
    pub fn is_session_bar(&self) -> bool {
        matches!(self, Interval::OneDay | Interval::OneWeek)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1m" => Ok(Interval::OneMinute),
            "5m" => Ok(Interval::FiveMinutes),
            "1h" | "60m" => Ok(Interval::OneHour),
            "1d" => Ok(Interval::OneDay),
            "1wk" => Ok(Interval::OneWeek),
            other => Err(ProviderError::Other(format!("unsupported interval '{other}'"))),
        }
    }
}

/// Yahoo Finance v8 chart API response.
#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: Option<ChartMeta>,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    #[serde(default)]
    gmtoffset: i64,
    current_trading_period: Option<TradingPeriods>,
}

#[derive(Debug, Deserialize)]
struct TradingPeriods {
    regular: Option<TradingPeriod>,
}

#[derive(Debug, Deserialize)]
struct TradingPeriod {
    start: i64,
    end: i64,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Default, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

/// Yahoo Finance data provider.
pub struct YahooProvider {
    client: reqwest::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    symbol: String,
    interval: Interval,
    period: String,
    window: FetchWindow,
    max_retries: u32,
    base_delay: Duration,
}

impl YahooProvider {
    pub fn new(
        symbol: impl Into<String>,
        interval: Interval,
        period: impl Into<String>,
        window: FetchWindow,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .map_err(|e| ProviderError::Other(format!("failed to build HTTP client: {e}")))?;

        let symbol = symbol.into();
        if interval == Interval::OneMinute {
            warn!(%symbol, "1m interval: history is limited to the last {ONE_MINUTE_HISTORY_DAYS} days");
        }

        Ok(Self {
            client,
            circuit_breaker,
            symbol,
            interval,
            period: period.into(),
            window,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        })
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// The window actually requested: one-minute bars never start earlier
    /// than a week ago.
    fn effective_window(&self, now: DateTime<Utc>) -> FetchWindow {
        let mut window = self.window;
        if self.interval == Interval::OneMinute {
            let floor = now - ChronoDuration::days(ONE_MINUTE_HISTORY_DAYS);
            if window.start.map_or(true, |s| s < floor) {
                debug!(symbol = %self.symbol, %floor, "clamped 1m window start");
                window.start = Some(floor);
            }
        }
        window
    }

    /// Build the chart API URL for the current window.
    fn chart_url(&self, window: &FetchWindow, now: DateTime<Utc>) -> String {
        let mut url = format!(
            "{CHART_URL}/{}?interval={}&includeAdjustedClose=true",
            self.symbol, self.interval
        );
        if window.is_unbounded() {
            url.push_str(&format!("&range={}", self.period));
        } else {
            let start = window.start.map_or(0, |s| s.timestamp());
            let end = window.end.unwrap_or(now).timestamp();
            url.push_str(&format!("&period1={start}&period2={end}"));
        }
        if !self.interval.is_session_bar() {
            url.push_str("&includePrePost=true");
        }
        url
    }

    /// Execute the request with retry and circuit breaker logic.
    async fn fetch_with_retry(&self, url: &str) -> Result<ChartResponse, ProviderError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(ProviderError::CircuitBreakerTripped);
        }

        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay * 2u32.pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }

            if !self.circuit_breaker.is_allowed() {
                return Err(ProviderError::CircuitBreakerTripped);
            }

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();

                    if status == reqwest::StatusCode::FORBIDDEN {
                        // IP ban
                        self.circuit_breaker.trip();
                        return Err(ProviderError::CircuitBreakerTripped);
                    }

                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        self.circuit_breaker.record_failure();
                        let retry_after = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(60);
                        last_error = Some(ProviderError::RateLimited {
                            retry_after_secs: retry_after,
                        });
                        continue;
                    }

                    if status == reqwest::StatusCode::NOT_FOUND {
                        return Err(ProviderError::SymbolNotFound {
                            symbol: self.symbol.clone(),
                        });
                    }

                    if !status.is_success() {
                        self.circuit_breaker.record_failure();
                        last_error = Some(ProviderError::Other(format!(
                            "HTTP {status} for {}",
                            self.symbol
                        )));
                        continue;
                    }

                    let chart: ChartResponse = resp.json().await.map_err(|e| {
                        ProviderError::ResponseFormatChanged(format!(
                            "failed to parse response for {}: {e}",
                            self.symbol
                        ))
                    })?;
                    self.circuit_breaker.record_success();
                    return Ok(chart);
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    warn!(symbol = %self.symbol, attempt, error = %e, "request failed, retrying");
                    last_error = Some(ProviderError::NetworkUnreachable(e.to_string()));
                }
                Err(e) => return Err(ProviderError::NetworkUnreachable(e.to_string())),
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::Other("max retries exceeded".into())))
    }
}

/// Exchange-local time of day the regular session ends.
fn session_close(regular: Option<&TradingPeriod>, gmtoffset: i64) -> NaiveTime {
    regular
        .and_then(|r| DateTime::from_timestamp(r.end + gmtoffset, 0))
        .map(|local| local.time())
        .or_else(|| NaiveTime::from_hms_opt(DEFAULT_SESSION_CLOSE.0, DEFAULT_SESSION_CLOSE.1, 0))
        .unwrap_or_default()
}

/// Turn a chart response into rows.
///
/// Session bars (daily, weekly) are stamped at the exchange-local close
/// of the regular trading period in the response metadata (16:00 when it
/// is missing), converted to UTC with the response's `gmtoffset`. While the
/// regular session is open the bar for today is still forming and is
/// dropped. Bars with no OHLCV value at all (holidays) are skipped, and a
/// repeated timestamp keeps the last bar.
fn parse_chart(
    symbol: &str,
    interval: Interval,
    resp: ChartResponse,
    now: DateTime<Utc>,
) -> Result<Frame, ProviderError> {
    let result = match resp.chart.result {
        Some(result) => result,
        None => {
            return Err(match resp.chart.error {
                Some(err) if err.code == "Not Found" => ProviderError::SymbolNotFound {
                    symbol: symbol.to_string(),
                },
                Some(err) => {
                    ProviderError::ResponseFormatChanged(format!("{}: {}", err.code, err.description))
                }
                None => ProviderError::ResponseFormatChanged("empty result with no error".into()),
            })
        }
    };

    let data = result
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::ResponseFormatChanged("result array is empty".into()))?;

    // no timestamps means no bars in the requested window
    let Some(timestamps) = data.timestamp else {
        return Ok(Frame::new());
    };

    let quote = data.indicators.quote.into_iter().next().unwrap_or_default();
    let adj_closes = data
        .indicators
        .adjclose
        .and_then(|v| v.into_iter().next())
        .map(|a| a.adjclose);

    let gmtoffset = data.meta.as_ref().map_or(0, |m| m.gmtoffset);
    let regular = data
        .meta
        .as_ref()
        .and_then(|m| m.current_trading_period.as_ref())
        .and_then(|p| p.regular.as_ref());
    let session_open = regular.is_some_and(|r| (r.start..r.end).contains(&now.timestamp()));
    let offset = ChronoDuration::seconds(gmtoffset);
    let today_local = (now + offset).date_naive();
    let close_time = session_close(regular, gmtoffset);

    let mut frame = Frame::new();
    for (i, &ts) in timestamps.iter().enumerate() {
        let Some(raw) = DateTime::from_timestamp(ts, 0) else {
            return Err(ProviderError::ResponseFormatChanged(format!("invalid timestamp: {ts}")));
        };

        let open = quote.open.get(i).copied().flatten();
        let high = quote.high.get(i).copied().flatten();
        let low = quote.low.get(i).copied().flatten();
        let close = quote.close.get(i).copied().flatten();
        let volume = quote.volume.get(i).copied().flatten();
        let adj_close = adj_closes.as_ref().and_then(|v| v.get(i).copied().flatten());

        if open.is_none() && high.is_none() && low.is_none() && close.is_none() && volume.is_none() {
            continue;
        }

        let timestamp = if interval.is_session_bar() {
            let local_date = (raw + offset).date_naive();
            if interval == Interval::OneDay && session_open && local_date == today_local {
                debug!(%symbol, "skipping in-progress daily bar");
                continue;
            }
            local_date.and_time(close_time).and_utc() - offset
        } else {
            raw
        };

        let mut row = Row::new(timestamp);
        for (name, value) in [
            ("open", open),
            ("high", high),
            ("low", low),
            ("close", close),
            ("adj_close", adj_close),
            ("volume", volume),
        ] {
            if let Some(v) = value {
                row.fields.insert(name.to_string(), v.into());
            }
        }
        frame.push(row);
    }

    frame.sort_by_timestamp();
    frame.dedup_by_timestamp_keep_last();
    Ok(frame)
}

#[async_trait]
impl DataProvider for YahooProvider {
    fn name(&self) -> &str {
        "yahoo_finance"
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
        let now = Utc::now();
        let window = self.effective_window(now);
        if window.is_inverted() {
            return Ok(Frame::new());
        }

        let url = self.chart_url(&window, now);
        debug!(symbol = %self.symbol, %url, "fetching chart");
        let chart = self.fetch_with_retry(&url).await?;
        let mut frame = parse_chart(&self.symbol, self.interval, chart, now)?;
        frame.filter_range(window.start, window.end);

        if frame.is_empty() {
            warn!(symbol = %self.symbol, "no data found");
        }
        Ok(frame)
    }

    async fn ping(&self) -> bool {
        if !self.circuit_breaker.is_allowed() {
            return false;
        }
        let url = format!("{CHART_URL}/{}?interval=1d&range=1d", self.symbol);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "ping failed");
                false
            }
        }
    }
}
