//! Chart Protocol Messages
//!
//! The nine calls sent per attempt and the classification of server calls
//! into stream signals.
//!
//! # Send Order
//!
//! 1. `set_auth_token`
//! 2. `chart_create_session`
//! 3. `quote_create_session`
//! 4. `quote_set_fields`
//! 5. `quote_add_symbols`
//! 6. `quote_fast_symbols`
//! 7. `resolve_symbol`
//! 8. `create_series`
//! 9. `switch_timezone`

use serde::Serialize;
use serde_json::{Value, json};

use super::codec::{CodecError, ServerMessage, encode_message};
use crate::domain::market_data::FetchRequest;
use crate::domain::session::{AuthToken, SessionIds};

/// Quote fields requested with `quote_set_fields`.
pub const QUOTE_FIELDS: [&str; 23] = [
    "ch",
    "chp",
    "current_session",
    "description",
    "local_description",
    "language",
    "exchange",
    "fractional",
    "is_tradable",
    "lp",
    "lp_time",
    "minmov",
    "minmove2",
    "original_name",
    "pricescale",
    "pro_name",
    "short_name",
    "type",
    "update_mode",
    "volume",
    "currency_code",
    "rchp",
    "rtc",
];

/// Alias the resolved symbol is registered under.
pub const SYMBOL_ALIAS: &str = "symbol_1";

/// Series id used for the single requested series.
pub const SERIES_ID: &str = "s1";

/// Server call carrying historical bars.
pub const CHART_DATA_METHOD: &str = "timescale_update";

/// Server call marking a finished series.
pub const COMPLETED_METHOD: &str = "series_completed";

/// Server calls that end an attempt as failed.
pub const FAILURE_METHODS: [&str; 3] = ["series_error", "symbol_error", "critical_error"];

/// Apply the symbol formatting rule.
///
/// Symbols that already carry an `EXCHANGE:` prefix pass through unchanged.
/// Otherwise a futures contract index is appended as `<n>!`. The exchange
/// label of a request is never prepended.
#[must_use]
pub fn format_symbol(symbol: &str, contract: Option<u32>) -> String {
    match contract {
        Some(index) if !symbol.contains(':') => format!("{symbol}{index}!"),
        _ => symbol.to_string(),
    }
}

#[derive(Serialize)]
struct ResolvePayload<'a> {
    symbol: &'a str,
    adjustment: &'a str,
    session: &'a str,
}

/// Build the JSON-in-string parameter of `resolve_symbol`.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn resolve_payload(symbol: &str, extended_session: bool) -> Result<String, CodecError> {
    let payload = ResolvePayload {
        symbol,
        adjustment: "splits",
        session: if extended_session { "extended" } else { "regular" },
    };
    Ok(format!("={}", serde_json::to_string(&payload)?))
}

// =============================================================================
// Outbound
// =============================================================================

/// One call to send.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Function name.
    pub function: &'static str,
    /// Positional parameters.
    pub params: Vec<Value>,
}

impl OutboundMessage {
    fn new(function: &'static str, params: Vec<Value>) -> Self {
        Self { function, params }
    }

    /// Frame this call for the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, CodecError> {
        encode_message(self.function, &self.params)
    }
}

/// Everything needed to build one attempt's handshake.
#[derive(Debug, Clone, Copy)]
pub struct ChartRequest<'a> {
    /// Token for `set_auth_token`.
    pub token: &'a AuthToken,
    /// Fresh session ids for this attempt.
    pub sessions: &'a SessionIds,
    /// What to fetch.
    pub request: &'a FetchRequest,
}

impl ChartRequest<'_> {
    /// The nine calls of one attempt, in send order.
    ///
    /// # Errors
    ///
    /// Returns an error if the resolve payload cannot be serialized.
    pub fn messages(&self) -> Result<Vec<OutboundMessage>, CodecError> {
        let quote = self.sessions.quote.as_str();
        let chart = self.sessions.chart.as_str();
        let symbol = format_symbol(&self.request.symbol, self.request.contract);

        let mut fields = Vec::with_capacity(QUOTE_FIELDS.len() + 1);
        fields.push(json!(quote));
        fields.extend(QUOTE_FIELDS.iter().map(|f| json!(f)));

        Ok(vec![
            OutboundMessage::new("set_auth_token", vec![json!(self.token.as_str())]),
            OutboundMessage::new("chart_create_session", vec![json!(chart), json!("")]),
            OutboundMessage::new("quote_create_session", vec![json!(quote)]),
            OutboundMessage::new("quote_set_fields", fields),
            OutboundMessage::new(
                "quote_add_symbols",
                vec![
                    json!(quote),
                    json!(symbol),
                    json!({ "flags": ["force_permission"] }),
                ],
            ),
            OutboundMessage::new("quote_fast_symbols", vec![json!(quote), json!(symbol)]),
            OutboundMessage::new(
                "resolve_symbol",
                vec![
                    json!(chart),
                    json!(SYMBOL_ALIAS),
                    json!(resolve_payload(&symbol, self.request.extended_session)?),
                ],
            ),
            OutboundMessage::new(
                "create_series",
                vec![
                    json!(chart),
                    json!(SERIES_ID),
                    json!(SERIES_ID),
                    json!(SYMBOL_ALIAS),
                    json!(self.request.interval.as_str()),
                    json!(self.request.bar_count),
                ],
            ),
            OutboundMessage::new("switch_timezone", vec![json!(chart), json!("exchange")]),
        ])
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// What a server call means for the running attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    /// Carries bars.
    ChartData,
    /// The series is complete.
    Completed,
    /// The attempt failed, with the server's detail.
    Failed(String),
    /// Anything else.
    Other,
}

/// Classify a decoded server call.
#[must_use]
pub fn classify(message: &ServerMessage) -> StreamSignal {
    match message.method.as_str() {
        CHART_DATA_METHOD => StreamSignal::ChartData,
        COMPLETED_METHOD => StreamSignal::Completed,
        method if FAILURE_METHODS.contains(&method) => {
            let detail = message
                .params
                .iter()
                .rev()
                .find_map(Value::as_str)
                .unwrap_or_default();
            StreamSignal::Failed(format!("{method}: {detail}"))
        }
        _ => StreamSignal::Other,
    }
}

/// Substring check for terminal markers in text that did not decode as
/// frames.
#[must_use]
pub fn scan_markers(text: &str) -> Option<StreamSignal> {
    if let Some(method) = FAILURE_METHODS.iter().find(|m| text.contains(*m)) {
        return Some(StreamSignal::Failed((*method).to_string()));
    }
    text.contains(COMPLETED_METHOD)
        .then_some(StreamSignal::Completed)
}
