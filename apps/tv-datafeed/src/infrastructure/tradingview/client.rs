//! Symbol Fetcher
//!
//! Runs the full chart handshake for one symbol and reads the stream until
//! a terminal marker arrives.
//!
//! # Attempt
//!
//! Each attempt draws fresh session ids, opens a connection, sends the nine
//! handshake calls, then receives until `series_completed` or a failure
//! marker. Heartbeats are echoed while reading. The connection is closed on
//! every path before the attempt returns.
//!
//! Reading is bounded three ways: a per-receive timeout, an overall attempt
//! deadline that also covers opening the connection, and a maximum message
//! count. Exceeding any of them fails the
//! attempt, and failed attempts are retried by the fetcher's
//! [`RetryPolicy`]. After the last attempt the caller gets
//! [`FetchOutcome::Failed`], never an error.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, FRAME_MARKER, Frame, FrameDecoder, decode_message};
use super::connection::{ConnectionManager, ManagedConnection};
use super::messages::{ChartRequest, OutboundMessage, StreamSignal, classify, scan_markers};
use super::parser::ChartStreamParser;
use crate::application::ports::{HistoryFetcher, TransportError};
use crate::application::services::retry::{Attempt, RetryPolicy};
use crate::domain::market_data::{FetchOutcome, FetchRequest, SymbolSeries};
use crate::domain::session::{AuthToken, SessionIds};
use crate::infrastructure::metrics::{self, AttemptOutcome};

// =============================================================================
// Settings and Errors
// =============================================================================

/// Per-fetch limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetcherSettings {
    /// Messages read before giving up on a terminal marker.
    pub max_messages: u32,
    /// Limit for one whole attempt, connection retries and handshake included.
    pub attempt_deadline: Duration,
    /// Attempts per fetch and the delay between them.
    pub retry: RetryPolicy,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            max_messages: 100,
            attempt_deadline: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Why an attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Open, send, or receive failed, or a receive timed out.
    #[error(transparent)]
    Connection(#[from] TransportError),

    /// The attempt ran past its deadline.
    #[error("attempt exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),

    /// The server reported an error for the series or symbol.
    #[error("{0}")]
    SeriesError(String),

    /// No terminal marker within the message bound.
    #[error("no terminal marker within {0} messages")]
    MessageLimit(u32),

    /// The server closed the connection before a terminal marker.
    #[error("connection closed before series completed")]
    StreamClosed,

    /// `series_completed` arrived but no bars were found.
    #[error("series completed without bars")]
    EmptySeries,

    /// A handshake call could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl FetchError {
    /// Metric label for this failure.
    #[must_use]
    pub const fn outcome(&self) -> AttemptOutcome {
        match self {
            Self::Connection(_) | Self::DeadlineExceeded(_) => AttemptOutcome::Connection,
            Self::SeriesError(_) | Self::MessageLimit(_) | Self::StreamClosed | Self::Codec(_) => {
                AttemptOutcome::Protocol
            }
            Self::EmptySeries => AttemptOutcome::Parse,
        }
    }
}

// =============================================================================
// Symbol Fetcher
// =============================================================================

/// Downloads historical bars one symbol at a time.
///
/// The auth token is fixed at construction and reused for every fetch.
#[derive(Debug)]
pub struct SymbolFetcher {
    connections: ConnectionManager,
    token: AuthToken,
    parser: ChartStreamParser,
    settings: FetcherSettings,
    rng: Mutex<StdRng>,
    cancel: CancellationToken,
}

impl SymbolFetcher {
    /// Create a fetcher with an OS-seeded session id generator.
    #[must_use]
    pub fn new(connections: ConnectionManager, token: AuthToken, settings: FetcherSettings) -> Self {
        Self {
            connections,
            token,
            parser: ChartStreamParser::new(),
            settings,
            rng: Mutex::new(StdRng::from_os_rng()),
            cancel: CancellationToken::new(),
        }
    }

    /// Use `rng` for session ids.
    #[must_use]
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    /// Stop waiting between attempts when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token sent with every attempt.
    #[must_use]
    pub const fn token(&self) -> &AuthToken {
        &self.token
    }

    /// Fetch `request`, retrying failed attempts.
    pub async fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
        self.fetch_reporting(request, &mut |_: Attempt, _: &str| {}).await
    }

    /// Like [`fetch`](Self::fetch), calling `on_attempt_failed` with each
    /// attempt's error as soon as that attempt fails.
    pub async fn fetch_reporting(
        &self,
        request: &FetchRequest,
        on_attempt_failed: &mut (dyn FnMut(Attempt, &str) + Send),
    ) -> FetchOutcome {
        let tag = request.series_tag();
        let mut errors = Vec::new();

        let result = self
            .settings
            .retry
            .run(
                &self.cancel,
                |attempt| {
                    tracing::info!(
                        symbol = %request.symbol,
                        attempt = %attempt,
                        bars = request.bar_count,
                        "Fetching history"
                    );
                    self.attempt(request, &tag)
                },
                |attempt, err| {
                    tracing::warn!(
                        symbol = %request.symbol,
                        attempt = %attempt,
                        error = %err,
                        "Fetch attempt failed"
                    );
                    let text = err.to_string();
                    on_attempt_failed(attempt, &text);
                    errors.push(text);
                },
            )
            .await;

        match result {
            Ok(series) => {
                tracing::info!(symbol = %request.symbol, bars = series.len(), "History fetched");
                FetchOutcome::Fetched(series)
            }
            Err(err) => {
                tracing::error!(
                    symbol = %request.symbol,
                    attempts = err.attempts(),
                    "All fetch attempts failed"
                );
                FetchOutcome::failed(tag, errors)
            }
        }
    }

    async fn attempt(&self, request: &FetchRequest, tag: &str) -> Result<SymbolSeries, FetchError> {
        let started = Instant::now();
        let result = self.run_attempt(request, tag).await;

        let outcome = result
            .as_ref()
            .map_or_else(FetchError::outcome, |_| AttemptOutcome::Success);
        metrics::record_attempt(outcome, started.elapsed());
        result
    }

    async fn run_attempt(
        &self,
        request: &FetchRequest,
        tag: &str,
    ) -> Result<SymbolSeries, FetchError> {
        let sessions = SessionIds::generate(&mut *self.rng.lock());
        let messages = ChartRequest {
            token: &self.token,
            sessions: &sessions,
            request,
        }
        .messages()?;

        let deadline = self.settings.attempt_deadline;
        let expires = tokio::time::Instant::now() + deadline;
        let mut connection = tokio::time::timeout_at(expires, self.connections.open())
            .await
            .map_err(|_| FetchError::DeadlineExceeded(deadline))??;
        let streamed =
            tokio::time::timeout_at(expires, self.stream(&mut connection, &messages)).await;

        if let Err(e) = connection.close().await {
            tracing::debug!(error = %e, "Close failed");
        }

        let raw = streamed.map_err(|_| FetchError::DeadlineExceeded(deadline))??;
        let series = self.parser.parse(&raw, tag);
        if series.is_empty() {
            return Err(FetchError::EmptySeries);
        }

        metrics::record_bars(series.len());
        Ok(series)
    }

    /// Send the handshake and collect text until a terminal marker.
    async fn stream(
        &self,
        connection: &mut ManagedConnection,
        messages: &[OutboundMessage],
    ) -> Result<String, FetchError> {
        for message in messages {
            connection.send(message.encode()?).await?;
        }

        let mut raw = String::new();
        let mut decoder = FrameDecoder::new();

        for received in 1..=self.settings.max_messages {
            let Some(text) = connection.receive().await? else {
                return Err(FetchError::StreamClosed);
            };
            raw.push_str(&text);
            raw.push('\n');

            if received % 10 == 0 {
                tracing::debug!(received, "Still waiting for series");
            }

            decoder.push(&text);
            loop {
                match decoder.next_frame() {
                    Ok(Some(frame @ Frame::Heartbeat(_))) => {
                        if let Some(echo) = frame.echo() {
                            connection.send(echo).await?;
                        }
                    }
                    Ok(Some(Frame::Payload(payload))) => {
                        let Ok(Some(message)) = decode_message(&payload) else {
                            continue;
                        };
                        match classify(&message) {
                            StreamSignal::Completed => return Ok(raw),
                            StreamSignal::Failed(detail) => {
                                return Err(FetchError::SeriesError(detail));
                            }
                            StreamSignal::ChartData | StreamSignal::Other => {}
                        }
                    }
                    Ok(None) => break,
                    Err(e) => tracing::debug!(error = %e, "Skipping malformed frame"),
                }
            }

            if !text.starts_with(FRAME_MARKER) {
                match scan_markers(&text) {
                    Some(StreamSignal::Completed) => return Ok(raw),
                    Some(StreamSignal::Failed(detail)) => {
                        return Err(FetchError::SeriesError(detail));
                    }
                    _ => {}
                }
            }
        }

        Err(FetchError::MessageLimit(self.settings.max_messages))
    }
}

#[async_trait]
impl HistoryFetcher for SymbolFetcher {
    async fn fetch_one(
        &self,
        request: &FetchRequest,
        on_attempt_failed: &mut (dyn for<'s> FnMut(Attempt, &'s str) + Send),
    ) -> FetchOutcome {
        self.fetch_reporting(request, on_attempt_failed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_outcomes() {
        assert_eq!(
            FetchError::Connection(TransportError::Timeout(Duration::from_secs(1))).outcome(),
            AttemptOutcome::Connection
        );
        assert_eq!(
            FetchError::DeadlineExceeded(Duration::from_secs(60)).outcome(),
            AttemptOutcome::Connection
        );
        assert_eq!(FetchError::MessageLimit(100).outcome(), AttemptOutcome::Protocol);
        assert_eq!(FetchError::StreamClosed.outcome(), AttemptOutcome::Protocol);
        assert_eq!(FetchError::EmptySeries.outcome(), AttemptOutcome::Parse);
    }

    #[test]
    fn transport_errors_display_through() {
        let err = FetchError::from(TransportError::Connect("refused".into()));
        assert_eq!(err.to_string(), "connect failed: refused");
    }

    #[test]
    fn default_settings() {
        let settings = FetcherSettings::default();
        assert_eq!(settings.max_messages, 100);
        assert_eq!(settings.attempt_deadline, Duration::from_secs(60));
        assert_eq!(settings.retry.max_attempts(), 3);
    }
}
