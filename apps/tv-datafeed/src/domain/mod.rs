//! Domain Layer - Core market data and session types.
//!
//! This layer contains the bar, series and request types plus session
//! identity values. Nothing here performs I/O.

/// Bars, series, intervals and fetch requests.
pub mod market_data;

/// Credentials, auth tokens and session identifiers.
pub mod session;
