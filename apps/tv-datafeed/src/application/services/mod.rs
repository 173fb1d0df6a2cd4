//! Application Services
//!
//! Orchestration that sits above the ports.
//!
//! - `RetryPolicy`: bounded retry with a fixed delay, used by every retry loop
//! - `BatchRetryCoordinator`: sequential multi-round fetching of symbol lists

pub mod batch;
pub mod retry;

pub use batch::{
    BatchEvent, BatchReport, BatchRetryCoordinator, BatchSettings, LogEvent, Severity,
};
pub use retry::{Attempt, RetryError, RetryPolicy};
