//! Market Data Types
//!
//! Domain types for historical OHLCV downloads: the supported chart
//! intervals, fetch requests, bars, and the per-symbol series returned to
//! callers.
//!
//! # Design
//!
//! A fetch never surfaces an exception to its caller. Every attempt ends in a
//! [`FetchOutcome`], which is either a populated [`SymbolSeries`] or an
//! explicit failure marker carrying an empty series and the per-attempt error
//! messages.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while building a fetch request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// Symbol was empty or whitespace.
    #[error("symbol cannot be empty")]
    EmptySymbol,

    /// Requested zero bars.
    #[error("bar count must be greater than zero")]
    ZeroBarCount,

    /// Date range ends before it starts.
    #[error("invalid date range: {from} is after {to}")]
    InvalidRange {
        /// Range start.
        from: NaiveDate,
        /// Range end.
        to: NaiveDate,
    },

    /// Interval code not recognised.
    #[error("unknown interval code: {0}")]
    UnknownInterval(String),
}

// =============================================================================
// Interval
// =============================================================================

/// Chart bar granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Interval {
    /// One minute.
    Minute1,
    /// Three minutes.
    Minute3,
    /// Five minutes.
    Minute5,
    /// Fifteen minutes.
    Minute15,
    /// Thirty minutes.
    Minute30,
    /// Forty-five minutes.
    Minute45,
    /// One hour.
    Hour1,
    /// Two hours.
    Hour2,
    /// Three hours.
    Hour3,
    /// Four hours.
    Hour4,
    /// One trading day.
    #[default]
    Daily,
    /// One week.
    Weekly,
    /// One month.
    Monthly,
}

impl Interval {
    /// Every supported interval, shortest first.
    pub const ALL: [Self; 13] = [
        Self::Minute1,
        Self::Minute3,
        Self::Minute5,
        Self::Minute15,
        Self::Minute30,
        Self::Minute45,
        Self::Hour1,
        Self::Hour2,
        Self::Hour3,
        Self::Hour4,
        Self::Daily,
        Self::Weekly,
        Self::Monthly,
    ];

    /// Short display code, also the value sent in `create_series`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Minute1 => "1",
            Self::Minute3 => "3",
            Self::Minute5 => "5",
            Self::Minute15 => "15",
            Self::Minute30 => "30",
            Self::Minute45 => "45",
            Self::Hour1 => "1H",
            Self::Hour2 => "2H",
            Self::Hour3 => "3H",
            Self::Hour4 => "4H",
            Self::Daily => "1D",
            Self::Weekly => "1W",
            Self::Monthly => "1M",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim();
        Self::ALL
            .into_iter()
            .find(|interval| interval.as_str() == code)
            .or_else(|| {
                // "1m" is ambiguous with monthly, so only H/D/W are case-folded.
                let upper = code.to_ascii_uppercase();
                if upper.ends_with('M') {
                    return None;
                }
                Self::ALL
                    .into_iter()
                    .find(|interval| interval.as_str() == upper)
            })
            .ok_or_else(|| RequestError::UnknownInterval(s.to_string()))
    }
}

// =============================================================================
// Fetch Request
// =============================================================================

/// Request for one symbol's historical bars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Symbol as typed by the user, optionally `EXCHANGE:SYMBOL`.
    pub symbol: String,
    /// Exchange label used only for the caller's own naming.
    pub exchange: String,
    /// Bar granularity.
    pub interval: Interval,
    /// Number of bars to request (always > 0).
    pub bar_count: u32,
    /// Futures contract index (1 = front month), `None` for cash.
    pub contract: Option<u32>,
    /// Request the extended trading session instead of the regular one.
    pub extended_session: bool,
}

impl FetchRequest {
    /// Create a request for the regular session of a cash instrument.
    ///
    /// # Errors
    ///
    /// Returns an error if the symbol is blank or `bar_count` is zero.
    pub fn new(
        symbol: impl Into<String>,
        exchange: impl Into<String>,
        interval: Interval,
        bar_count: u32,
    ) -> Result<Self, RequestError> {
        let symbol = symbol.into().trim().to_string();
        if symbol.is_empty() {
            return Err(RequestError::EmptySymbol);
        }
        if bar_count == 0 {
            return Err(RequestError::ZeroBarCount);
        }

        Ok(Self {
            symbol,
            exchange: exchange.into(),
            interval,
            bar_count,
            contract: None,
            extended_session: false,
        })
    }

    /// Select a futures contract.
    #[must_use]
    pub const fn with_contract(mut self, contract: u32) -> Self {
        self.contract = Some(contract);
        self
    }

    /// Request the extended session.
    #[must_use]
    pub const fn with_extended_session(mut self, extended: bool) -> Self {
        self.extended_session = extended;
        self
    }

    /// Tag used for the returned series: the symbol with any
    /// `<exchange>:` prefix matching this request's label removed.
    #[must_use]
    pub fn series_tag(&self) -> String {
        if self.exchange.is_empty() {
            return self.symbol.clone();
        }
        self.symbol
            .strip_prefix(&format!("{}:", self.exchange))
            .unwrap_or(&self.symbol)
            .to_string()
    }
}

/// Number of daily bars covering `from..=to`.
///
/// # Errors
///
/// Returns [`RequestError::InvalidRange`] if `from` is after `to`.
pub fn bar_count_for_range(from: NaiveDate, to: NaiveDate) -> Result<u32, RequestError> {
    let days = (to - from).num_days();
    if days < 0 {
        return Err(RequestError::InvalidRange { from, to });
    }
    u32::try_from(days + 1).map_err(|_| RequestError::InvalidRange { from, to })
}

// =============================================================================
// Bars and Series
// =============================================================================

/// One OHLCV record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time.
    pub timestamp: DateTime<Utc>,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close price.
    pub close: f64,
    /// Traded volume, 0 when the feed has none.
    pub volume: f64,
}

/// Bars for one symbol, in the order the stream delivered them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolSeries {
    /// Symbol tag.
    pub symbol: String,
    /// Bars in received order.
    pub bars: Vec<Bar>,
}

impl SymbolSeries {
    /// Create a series.
    #[must_use]
    pub fn new(symbol: impl Into<String>, bars: Vec<Bar>) -> Self {
        Self {
            symbol: symbol.into(),
            bars,
        }
    }

    /// Create an empty series for `symbol`.
    #[must_use]
    pub fn empty(symbol: impl Into<String>) -> Self {
        Self::new(symbol, Vec::new())
    }

    /// Number of bars.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    /// Whether the series holds no bars.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

// =============================================================================
// Fetch Outcome
// =============================================================================

/// Result of fetching one symbol, with retries already applied.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Bars were downloaded.
    Fetched(SymbolSeries),
    /// Every attempt failed.
    Failed {
        /// Always empty.
        series: SymbolSeries,
        /// One message per failed attempt, oldest first.
        errors: Vec<String>,
    },
}

impl FetchOutcome {
    /// Failure marker for `symbol`.
    #[must_use]
    pub fn failed(symbol: impl Into<String>, errors: Vec<String>) -> Self {
        Self::Failed {
            series: SymbolSeries::empty(symbol),
            errors,
        }
    }

    /// Whether bars were downloaded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Fetched(_))
    }

    /// The series, empty on failure.
    #[must_use]
    pub const fn series(&self) -> &SymbolSeries {
        match self {
            Self::Fetched(series) | Self::Failed { series, .. } => series,
        }
    }

    /// Consume the outcome, returning the series.
    #[must_use]
    pub fn into_series(self) -> SymbolSeries {
        match self {
            Self::Fetched(series) | Self::Failed { series, .. } => series,
        }
    }

    /// Number of attempts that failed.
    #[must_use]
    pub fn failed_attempts(&self) -> usize {
        match self {
            Self::Fetched(_) => 0,
            Self::Failed { errors, .. } => errors.len(),
        }
    }
}
