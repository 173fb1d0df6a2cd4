//! TradingView Chart Adapters
//!
//! Implements the chart WebSocket protocol and its HTTP collaborators:
//!
//! - **codec**: `~m~<len>~m~<payload>` framing
//! - **messages**: handshake calls and server-call classification
//! - **parser**: `timescale_update` bars into [`SymbolSeries`](crate::SymbolSeries)
//! - **connection**: retried opens and the tokio-tungstenite transport
//! - **auth**: sign-in token with anonymous fallback
//! - **client**: per-symbol fetch with attempt retries
//! - **scanner**: exchange symbol lists

pub mod auth;
pub mod client;
pub mod codec;
pub mod connection;
pub mod messages;
pub mod parser;
pub mod scanner;

pub use auth::{AuthError, DEFAULT_SIGNIN_URL, SessionAuthenticator};
pub use client::{FetchError, FetcherSettings, SymbolFetcher};
pub use codec::{CodecError, Frame, FrameDecoder, ServerMessage, decode_message, encode_message};
pub use connection::{
    ConnectionManager, ConnectionSettings, DEFAULT_ORIGIN, DEFAULT_WS_URL, ManagedConnection,
    WsConnector,
};
pub use messages::{ChartRequest, OutboundMessage, QUOTE_FIELDS, StreamSignal, format_symbol};
pub use parser::ChartStreamParser;
pub use scanner::{DEFAULT_SCANNER_URL, ScannerClient};
