//! Symbol Scanner
//!
//! [`SymbolSource`] adapter that lists the symbols of an exchange through the
//! scanner HTTP API: one POST per market to `<base>/<region>/scan`, names
//! read from `data[*].d[0]`.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::application::ports::{SymbolSource, SymbolSourceError};

/// Default scanner base URL.
pub const DEFAULT_SCANNER_URL: &str = "https://scanner.tradingview.com";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/91.0.4472.124";

/// Scanner region and markets behind an exchange label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketScope {
    /// Region path segment.
    pub region: &'static str,
    /// Markets queried, one request each.
    pub markets: &'static [&'static str],
}

/// Map an exchange label to its scanner scope.
#[must_use]
pub fn market_scope(exchange: &str) -> Option<MarketScope> {
    let (region, markets): (&str, &[&str]) = match exchange {
        "NSE" => ("india", &["nse"]),
        "AMEX" => ("america", &["amex"]),
        "SNP 500" => ("america", &["nyse", "nasdaq"]),
        _ => return None,
    };
    Some(MarketScope { region, markets })
}

#[derive(Deserialize)]
struct ScanResponse {
    #[serde(default)]
    data: Vec<ScanRow>,
}

#[derive(Deserialize)]
struct ScanRow {
    #[serde(default)]
    d: Vec<Value>,
}

/// HTTP scanner client.
#[derive(Debug, Clone)]
pub struct ScannerClient {
    client: reqwest::Client,
    base_url: String,
}

impl ScannerClient {
    /// Per-request timeout.
    pub const TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a client against `base_url`.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn scan(&self, region: &str, market: &str) -> Result<Vec<String>, SymbolSourceError> {
        let body = json!({
            "filter": [],
            "options": { "lang": "en" },
            "markets": [market],
            "symbols": { "query": { "types": [] }, "tickers": [] },
            "columns": ["name"],
        });

        let response = self
            .client
            .post(format!("{}/{region}/scan", self.base_url))
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .json(&body)
            .timeout(Self::TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| SymbolSourceError::Request(e.to_string()))?;

        let parsed: ScanResponse = response
            .json()
            .await
            .map_err(|e| SymbolSourceError::InvalidResponse(e.to_string()))?;

        Ok(parsed
            .data
            .into_iter()
            .filter_map(|row| row.d.into_iter().next())
            .filter_map(|name| name.as_str().map(str::to_string))
            .filter(|name| !name.is_empty())
            .collect())
    }
}

#[async_trait]
impl SymbolSource for ScannerClient {
    async fn symbols(&self, exchange: &str) -> Result<Vec<String>, SymbolSourceError> {
        let scope = market_scope(exchange)
            .ok_or_else(|| SymbolSourceError::UnsupportedExchange(exchange.to_string()))?;

        let mut names = BTreeSet::new();
        for market in scope.markets {
            let found = self.scan(scope.region, market).await?;
            tracing::debug!(exchange, market, count = found.len(), "Scanned market");
            names.extend(found);
        }

        tracing::info!(exchange, count = names.len(), "Fetched symbol list");
        Ok(names.into_iter().collect())
    }
}
