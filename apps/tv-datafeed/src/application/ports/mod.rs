//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Connector` / `Connection`: duplex text transport to the chart endpoint
//! - `SymbolSource`: symbol-list lookup for an exchange
//!
//! ## Driver Ports (Inbound)
//!
//! - `HistoryFetcher`: one symbol's retried download, consumed by the batch
//!   coordinator

use std::time::Duration;

use async_trait::async_trait;

use crate::application::services::retry::Attempt;
use crate::domain::market_data::{FetchOutcome, FetchRequest};

// =============================================================================
// Transport
// =============================================================================

/// Transport failures. All of them count as a connection error for retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not establish the connection.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Every open attempt failed.
    #[error("connection failed after {attempts} attempt(s): {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: Box<TransportError>,
    },

    /// Writing a message failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Reading a message failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// An operation did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Closing the connection failed.
    #[error("close failed: {0}")]
    Close(String),
}

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// WebSocket URL.
    pub url: String,
    /// Extra handshake headers, e.g. `Origin`.
    pub headers: Vec<(String, String)>,
}

impl Endpoint {
    /// Endpoint without extra headers.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// Add a handshake header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Opens connections. Implementations must not retry internally.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one connection.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError>;
}

/// One open duplex text connection.
#[async_trait]
pub trait Connection: Send {
    /// Send one text message.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Wait for the next text message. `Ok(None)` means the peer closed.
    async fn receive(&mut self) -> Result<Option<String>, TransportError>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

// =============================================================================
// History Fetching
// =============================================================================

/// Downloads one symbol's bars, applying its own attempt retries.
///
/// Implementations never fail: exhaustion is reported as
/// [`FetchOutcome::Failed`].
#[async_trait]
pub trait HistoryFetcher: Send + Sync {
    /// Fetch `request`, retrying per attempt.
    ///
    /// `on_attempt_failed` is called as each attempt fails, before any retry
    /// delay, with the attempt position and the error text.
    async fn fetch_one(
        &self,
        request: &FetchRequest,
        on_attempt_failed: &mut (dyn for<'s> FnMut(Attempt, &'s str) + Send),
    ) -> FetchOutcome;
}

// =============================================================================
// Symbol Source
// =============================================================================

/// Symbol lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolSourceError {
    /// Exchange label has no known market mapping.
    #[error("exchange {0} not supported")]
    UnsupportedExchange(String),

    /// Request failed.
    #[error("symbol lookup failed: {0}")]
    Request(String),

    /// Response could not be decoded.
    #[error("invalid symbol lookup response: {0}")]
    InvalidResponse(String),
}

/// Lists tradable symbols for an exchange label.
#[async_trait]
pub trait SymbolSource: Send + Sync {
    /// Symbols listed on `exchange`, sorted and de-duplicated.
    async fn symbols(&self, exchange: &str) -> Result<Vec<String>, SymbolSourceError>;
}
