#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! TV Datafeed - Historical OHLCV Fetcher
//!
//! A client for TradingView's length-framed chart WebSocket protocol that
//! downloads historical bars for a symbol, and a batch layer that drives it
//! across symbol lists with bounded retries.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Bars, series, requests and session identity
//!   - `market_data`: `Bar`, `SymbolSeries`, `Interval`, `FetchRequest`
//!   - `session`: credentials, auth token, session id generation
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: transport, history fetching and symbol-list interfaces
//!   - `services`: retry policy and the batch retry coordinator
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `tradingview`: codec, handshake, parser, connection, sign-in, scanner
//!   - `config`: environment configuration
//!   - `telemetry` / `metrics`: tracing and Prometheus
//!
//! # Data Flow
//!
//! ```text
//!                      ┌────────────────────┐  per symbol   ┌───────────────┐
//! symbols ───────────► │ BatchRetryCoord.   │ ────────────► │ SymbolFetcher │
//!                      │  pass 1 + rounds   │ ◄──────────── │  attempts     │
//!                      └────────────────────┘  FetchOutcome └───────┬───────┘
//!                                                                   │ fresh session
//!                                                                   ▼
//!                                           ConnectionManager ──► WebSocket
//!                                           FrameDecoder ◄──────  ~m~len~m~json
//!                                           ChartStreamParser ──► SymbolSeries
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Market data and session types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market_data::{
    Bar, FetchOutcome, FetchRequest, Interval, RequestError, SymbolSeries, bar_count_for_range,
};
pub use domain::session::{AuthToken, Credentials, SessionIds, generate_session_id};

// Ports
pub use application::ports::{
    Connection, Connector, Endpoint, HistoryFetcher, SymbolSource, SymbolSourceError,
    TransportError,
};

// Services
pub use application::services::{
    Attempt, BatchEvent, BatchReport, BatchRetryCoordinator, BatchSettings, LogEvent, RetryError,
    RetryPolicy, Severity,
};

// TradingView adapters
pub use infrastructure::tradingview::{
    AuthError, ChartStreamParser, ConnectionManager, ConnectionSettings, FetchError,
    FetcherSettings, FrameDecoder, ManagedConnection, ScannerClient, SessionAuthenticator,
    SymbolFetcher, WsConnector, encode_message,
};

// Configuration
pub use infrastructure::config::{ConfigError, DatafeedConfig};

// Metrics
pub use infrastructure::metrics::{AttemptOutcome, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
