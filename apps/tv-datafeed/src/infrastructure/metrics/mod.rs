//! Prometheus Metrics Module
//!
//! Counters and histograms for fetch attempts and batches.
//!
//! # Metrics
//!
//! - `tv_datafeed_attempts_total{outcome}`: fetch attempts by outcome
//! - `tv_datafeed_attempt_seconds{outcome}`: attempt duration
//! - `tv_datafeed_bars_total`: bars parsed from completed series
//! - `tv_datafeed_connect_failures_total`: failed WebSocket opens
//! - `tv_datafeed_symbols_total{outcome}`: final per-symbol batch outcome
//!
//! Recording is a no-op until [`init_metrics`] installs the recorder.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Returns `None` if another recorder is already installed. Calling this
/// more than once returns the first result.
pub fn init_metrics() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                register_metrics();
                Some(handle)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Prometheus recorder not installed");
                None
            }
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned().flatten()
}

fn register_metrics() {
    describe_counter!("tv_datafeed_attempts_total", "Fetch attempts by outcome");
    describe_histogram!(
        "tv_datafeed_attempt_seconds",
        "Duration of one connect-through-parse attempt"
    );
    describe_counter!("tv_datafeed_bars_total", "Bars parsed from completed series");
    describe_counter!(
        "tv_datafeed_connect_failures_total",
        "Failed WebSocket connection attempts"
    );
    describe_counter!(
        "tv_datafeed_symbols_total",
        "Final batch outcome per symbol"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric label for how an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Bars were parsed.
    Success,
    /// Transport failure, timeout, or deadline.
    Connection,
    /// Error marker, message bound, or early close.
    Protocol,
    /// No bars after completion.
    Parse,
}

impl AttemptOutcome {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Connection => "connection",
            Self::Protocol => "protocol",
            Self::Parse => "parse",
        }
    }
}

/// Record one finished attempt.
pub fn record_attempt(outcome: AttemptOutcome, duration: Duration) {
    counter!("tv_datafeed_attempts_total", "outcome" => outcome.as_str()).increment(1);
    histogram!("tv_datafeed_attempt_seconds", "outcome" => outcome.as_str())
        .record(duration.as_secs_f64());
}

/// Record bars parsed from a completed series.
pub fn record_bars(count: usize) {
    counter!("tv_datafeed_bars_total").increment(u64::try_from(count).unwrap_or(u64::MAX));
}

/// Record a failed connection attempt.
pub fn record_connect_failure() {
    counter!("tv_datafeed_connect_failures_total").increment(1);
}

/// Record final batch outcomes.
pub fn record_symbols(succeeded: usize, failed: usize) {
    let to_u64 = |n: usize| u64::try_from(n).unwrap_or(u64::MAX);
    counter!("tv_datafeed_symbols_total", "outcome" => "success").increment(to_u64(succeeded));
    counter!("tv_datafeed_symbols_total", "outcome" => "failure").increment(to_u64(failed));
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_outcome_as_str() {
        assert_eq!(AttemptOutcome::Success.as_str(), "success");
        assert_eq!(AttemptOutcome::Connection.as_str(), "connection");
        assert_eq!(AttemptOutcome::Protocol.as_str(), "protocol");
        assert_eq!(AttemptOutcome::Parse.as_str(), "parse");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_attempt(AttemptOutcome::Success, Duration::from_millis(5));
        record_bars(10);
        record_connect_failure();
        record_symbols(1, 0);
    }
}
