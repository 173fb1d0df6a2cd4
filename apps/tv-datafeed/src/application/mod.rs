//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (chart transport, symbol lists).
pub mod ports;

/// Application services for retry and batch orchestration.
pub mod services;
