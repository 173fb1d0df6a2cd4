//! Chart Stream Parser
//!
//! Turns the raw text collected during one attempt into bars.
//!
//! Framed text is split with [`FrameDecoder`] and only `timescale_update`
//! calls are read. Text that does not decode as frames falls back to
//! locating the `"s":[...]` array directly.
//!
//! Each bar record is `{"i":<n>,"v":[<epoch secs>,o,h,l,c,<volume>]}`.
//! Unparsable prices become 0. Once a record lacks volume, every later
//! record in the same series gets volume 0 without being read.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::codec::{Frame, FrameDecoder, decode_message};
use super::messages::{StreamSignal, classify};
use crate::domain::market_data::{Bar, SymbolSeries};

const BAR_ARRAY_KEY: &str = r#""s":["#;

/// Stateless bar extractor.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChartStreamParser;

impl ChartStreamParser {
    /// Create a parser.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Extract bars for `symbol` from an attempt's raw text.
    ///
    /// Never fails: no bar data yields an empty series.
    #[must_use]
    pub fn parse(&self, raw: &str, symbol: &str) -> SymbolSeries {
        let mut state = SeriesState::default();

        let framed = match chart_payloads(raw) {
            Some(payloads) => {
                for payload in &payloads {
                    for records in series_arrays(payload) {
                        state.extend(records);
                    }
                }
                true
            }
            None => false,
        };

        if !framed
            && let Some(records) = locate_bar_array(raw)
        {
            state.extend(&records);
        }

        if state.bars.is_empty() {
            tracing::debug!(symbol, framed, "No bar data found");
        }
        SymbolSeries::new(symbol, state.bars)
    }
}

#[derive(Default)]
struct SeriesState {
    bars: Vec<Bar>,
    volume_missing: bool,
}

impl SeriesState {
    fn extend(&mut self, records: &[Value]) {
        for record in records {
            let Some(fields) = record.get("v").and_then(Value::as_array) else {
                continue;
            };
            if let Some(bar) = self.bar(fields) {
                self.bars.push(bar);
            }
        }
    }

    fn bar(&mut self, fields: &[Value]) -> Option<Bar> {
        let timestamp = fields.first().and_then(number).map(to_timestamp)?;
        let price = |idx: usize| fields.get(idx).and_then(number).unwrap_or(0.0);

        let volume = if self.volume_missing {
            0.0
        } else if let Some(volume) = fields.get(5).and_then(number) {
            volume
        } else {
            tracing::debug!("No volume data");
            self.volume_missing = true;
            0.0
        };

        Some(Bar {
            timestamp,
            open: price(1),
            high: price(2),
            low: price(3),
            close: price(4),
            volume,
        })
    }
}

fn number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|v: &f64| v.is_finite())
}

#[allow(clippy::cast_possible_truncation)]
fn to_timestamp(secs: f64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis((secs * 1000.0).round() as i64).unwrap_or_default()
}

/// Payloads of every `timescale_update` frame, or `None` if `raw` is not
/// framed text.
fn chart_payloads(raw: &str) -> Option<Vec<Value>> {
    if !raw.trim_start().starts_with("~m~") {
        return None;
    }

    let mut decoder = FrameDecoder::new();
    let mut payloads = Vec::new();
    for line in raw.lines() {
        decoder.push(line);
        loop {
            match decoder.next_frame() {
                Ok(Some(Frame::Payload(payload))) => {
                    if let Ok(Some(message)) = decode_message(&payload)
                        && classify(&message) == StreamSignal::ChartData
                    {
                        payloads.extend(message.params.into_iter().skip(1));
                    }
                }
                Ok(Some(Frame::Heartbeat(_))) => {}
                Ok(None) => break,
                Err(err) => tracing::debug!(error = %err, "Skipping malformed frame"),
            }
        }
    }
    Some(payloads)
}

/// Bar arrays of every series in a `timescale_update` parameter.
fn series_arrays(payload: &Value) -> impl Iterator<Item = &[Value]> {
    payload
        .as_object()
        .into_iter()
        .flat_map(|series| series.values())
        .filter_map(|entry| entry.get("s").and_then(Value::as_array))
        .map(Vec::as_slice)
}

/// Find the first `"s":[...]` array in unframed text.
fn locate_bar_array(raw: &str) -> Option<Vec<Value>> {
    let start = raw.find(BAR_ARRAY_KEY)? + BAR_ARRAY_KEY.len() - 1;
    let tail = &raw[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in tail.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&tail[..=offset]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::tradingview::codec::frame;
    use serde_json::json;

    const DAY: f64 = 86_400.0;
    const START: f64 = 1_704_067_200.0;

    fn timescale_frame(records: &Value) -> String {
        let payload = json!({
            "m": "timescale_update",
            "p": ["cs_test", {
                "s1": { "node": "n", "s": records, "ns": { "d": "" }, "t": "s1" },
                "index": { "index": 0, "zoffset": 0, "changes": [], "marks": [] }
            }]
        });
        frame(&payload.to_string())
    }

    fn record(i: usize, values: &Value) -> Value {
        json!({ "i": i, "v": values })
    }

    #[test]
    fn parses_framed_timescale_update() {
        let records = json!([
            record(0, &json!([START, 10.0, 12.0, 9.0, 11.0, 1000.0])),
            record(1, &json!([START + DAY, 11.0, 13.0, 10.0, 12.0, 1500.0])),
        ]);
        let raw = format!(
            "{}\n{}{}\n",
            frame(r#"{"session_id":"x","timestamp":1}"#),
            timescale_frame(&records),
            frame(r#"{"m":"series_completed","p":["cs_test","s1"]}"#)
        );

        let series = ChartStreamParser::new().parse(&raw, "TCS");
        assert_eq!(series.symbol, "TCS");
        assert_eq!(series.len(), 2);
        assert_eq!(series.bars[1].close, 12.0);
        assert_eq!(series.bars[1].volume, 1500.0);
        assert_eq!(series.bars[0].timestamp.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn missing_volume_is_sticky() {
        let records = json!([
            record(0, &json!([START, 1.0, 1.0, 1.0, 1.0, 100.0])),
            record(1, &json!([START + DAY, 2.0, 2.0, 2.0, 2.0, 200.0])),
            record(2, &json!([START + 2.0 * DAY, 3.0, 3.0, 3.0, 3.0])),
            record(3, &json!([START + 3.0 * DAY, 4.0, 4.0, 4.0, 4.0, 400.0])),
            record(4, &json!([START + 4.0 * DAY, 5.0, 5.0, 5.0, 5.0, 500.0])),
        ]);

        let series = ChartStreamParser::new().parse(&timescale_frame(&records), "X");
        let volumes: Vec<f64> = series.bars.iter().map(|b| b.volume).collect();
        assert_eq!(volumes, vec![100.0, 200.0, 0.0, 0.0, 0.0]);
        assert_eq!(series.bars[4].close, 5.0);
    }

    #[test]
    fn bad_price_fields_become_zero() {
        let records = json!([record(0, &json!([START, "abc", null, 3.5, "4.25", 10]))]);
        let bar = ChartStreamParser::new().parse(&timescale_frame(&records), "X").bars[0];
        assert_eq!((bar.open, bar.high, bar.low, bar.close), (0.0, 0.0, 3.5, 4.25));
    }

    #[test]
    fn keeps_received_order() {
        let records = json!([
            record(0, &json!([START + DAY, 2.0, 2.0, 2.0, 2.0, 1.0])),
            record(1, &json!([START, 1.0, 1.0, 1.0, 1.0, 1.0])),
        ]);
        let series = ChartStreamParser::new().parse(&timescale_frame(&records), "X");
        assert!(series.bars[0].timestamp > series.bars[1].timestamp);
    }

    #[test]
    fn ignores_bar_arrays_in_other_calls() {
        let other = frame(&json!({"m": "du", "p": ["cs_test", {"s1": {"s": [
            record(9, &json!([START, 9.0, 9.0, 9.0, 9.0, 9.0]))
        ]}}]}).to_string());
        let series = ChartStreamParser::new().parse(&other, "X");
        assert!(series.is_empty());
    }

    #[test]
    fn unframed_text_falls_back_to_bar_array() {
        let raw = r#"junk {"s":[{"i":0,"v":[1704067200,1,2,0.5,1.5,10]},{"i":1,"v":[1704153600,1.5,2.5,1,2,20]}],"ns":{}} tail"#;
        let series = ChartStreamParser::new().parse(raw, "X");
        assert_eq!(series.len(), 2);
        assert_eq!(series.bars[1].volume, 20.0);
    }

    #[test]
    fn no_bar_array_yields_empty_series() {
        assert!(ChartStreamParser::new().parse("nothing here", "X").is_empty());
        assert!(ChartStreamParser::new()
            .parse(&frame(r#"{"m":"series_completed","p":[]}"#), "X")
            .is_empty());
    }
}
