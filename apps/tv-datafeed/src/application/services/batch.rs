//! Batch Retry Coordinator
//!
//! Drives a [`HistoryFetcher`] over an ordered symbol list.
//!
//! # Flow
//!
//! 1. Pass 1 fetches every symbol in input order, reporting progress after
//!    each one and sleeping a fixed delay between symbols.
//! 2. Up to `rounds.max_attempts()` retry rounds re-run the symbols still
//!    pending, in the order they first failed.
//! 3. Whatever still fails is reported in [`BatchReport::failures`].
//!
//! The coordinator never fails. Cancellation is checked between symbols and
//! during every sleep; symbols not yet fetched when it fires are reported as
//! failures.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::retry::{Attempt, RetryPolicy, pause};
use crate::application::ports::HistoryFetcher;
use crate::domain::market_data::{FetchOutcome, FetchRequest, SymbolSeries};

// =============================================================================
// Events
// =============================================================================

/// Severity tag attached to batch log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Routine progress.
    Info,
    /// A symbol was downloaded.
    Success,
    /// A recoverable failure.
    Warning,
    /// A final failure.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Human-readable batch log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Severity tag.
    pub severity: Severity,
    /// Message text.
    pub message: String,
}

impl LogEvent {
    /// Create a log event.
    #[must_use]
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }

    fn trace(&self) {
        match self.severity {
            Severity::Info => tracing::info!(message = %self.message, "batch"),
            Severity::Success => tracing::info!(message = %self.message, outcome = "success", "batch"),
            Severity::Warning => tracing::warn!(message = %self.message, "batch"),
            Severity::Error => tracing::error!(message = %self.message, "batch"),
        }
    }
}

/// Event forwarded by a spawned batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    /// Fraction of pass 1 completed, in `(0, 1]`.
    Progress(f64),
    /// Log line.
    Log(LogEvent),
}

// =============================================================================
// Settings and Report
// =============================================================================

/// Batch pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    /// Sleep between consecutive symbols.
    pub symbol_delay: Duration,
    /// Retry rounds after pass 1, and the pause before each round.
    pub rounds: RetryPolicy,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            symbol_delay: Duration::from_secs(2),
            rounds: RetryPolicy::default(),
        }
    }
}

/// Outcome of a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    /// Downloaded series keyed by requested symbol.
    pub results: HashMap<String, SymbolSeries>,
    /// Symbols that never succeeded, in first-failure order.
    pub failures: Vec<String>,
    /// Whether the batch stopped early on cancellation.
    pub cancelled: bool,
}

impl BatchReport {
    /// Whether every symbol was downloaded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Sequential multi-round batch fetcher.
pub struct BatchRetryCoordinator {
    fetcher: Arc<dyn HistoryFetcher>,
    settings: BatchSettings,
    cancel: CancellationToken,
}

impl BatchRetryCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn HistoryFetcher>,
        settings: BatchSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            settings,
            cancel,
        }
    }

    /// Fetch every request, retrying failures in rounds.
    ///
    /// `on_progress` receives `processed / total` after each pass-1 symbol.
    /// `on_log` receives every log event, which is also mirrored to `tracing`.
    pub async fn fetch_many<P, L>(
        &self,
        requests: &[FetchRequest],
        mut on_progress: P,
        mut on_log: L,
    ) -> BatchReport
    where
        P: FnMut(f64) + Send,
        L: FnMut(LogEvent) + Send,
    {
        let total = requests.len();
        let mut report = BatchReport::default();

        let first_pass: Vec<&FetchRequest> = requests.iter().collect();
        #[allow(clippy::cast_precision_loss)]
        let (mut pending, cancelled) = self
            .run_pass(&first_pass, &mut report.results, &mut on_log, |done| {
                on_progress(done as f64 / total as f64);
            })
            .await;
        report.cancelled = cancelled;

        for round in self.settings.rounds.attempts() {
            if pending.is_empty() || report.cancelled {
                break;
            }
            if !self.settings.rounds.pause(&self.cancel).await {
                report.cancelled = true;
                break;
            }

            let names: Vec<&str> = pending.iter().map(|r| r.symbol.as_str()).collect();
            emit(
                &mut on_log,
                Severity::Warning,
                format!(
                    "Retry round {} for {} symbols: {}",
                    round.number,
                    pending.len(),
                    names.join(", ")
                ),
            );

            let (still_failing, cancelled) = self
                .run_pass(&pending, &mut report.results, &mut on_log, |_| {})
                .await;
            pending = still_failing;
            report.cancelled = cancelled;
        }

        report.failures = pending.iter().map(|r| r.symbol.clone()).collect();

        if report.failures.is_empty() && !report.cancelled {
            emit(
                &mut on_log,
                Severity::Success,
                format!("All {total} symbols fetched successfully"),
            );
        } else if report.failures.is_empty() {
            emit(&mut on_log, Severity::Warning, "Batch cancelled");
        } else {
            let prefix = if report.cancelled {
                "Batch cancelled; not fetched"
            } else {
                "Final failures"
            };
            emit(
                &mut on_log,
                Severity::Error,
                format!("{prefix}: {}", report.failures.join(", ")),
            );
        }

        report
    }

    /// Run `fetch_many` on its own task, forwarding events over `events`.
    ///
    /// Events are dropped silently if the receiver has gone away.
    pub fn spawn(
        self: Arc<Self>,
        requests: Vec<FetchRequest>,
        events: mpsc::UnboundedSender<BatchEvent>,
    ) -> JoinHandle<BatchReport> {
        tokio::spawn(async move {
            let progress = events.clone();
            self.fetch_many(
                &requests,
                move |fraction| {
                    let _ = progress.send(BatchEvent::Progress(fraction));
                },
                move |event| {
                    let _ = events.send(BatchEvent::Log(event));
                },
            )
            .await
        })
    }

    /// Fetch `batch` in order. Returns the requests that failed, plus the
    /// unprocessed tail if cancelled, and whether cancellation fired.
    async fn run_pass<'a, L, D>(
        &self,
        batch: &[&'a FetchRequest],
        results: &mut HashMap<String, SymbolSeries>,
        on_log: &mut L,
        mut on_done: D,
    ) -> (Vec<&'a FetchRequest>, bool)
    where
        L: FnMut(LogEvent) + Send,
        D: FnMut(usize) + Send,
    {
        let mut failed = Vec::new();

        for (index, request) in batch.iter().copied().enumerate() {
            let proceed = if index == 0 {
                !self.cancel.is_cancelled()
            } else {
                pause(self.settings.symbol_delay, &self.cancel).await
            };
            if !proceed {
                failed.extend(batch[index..].iter().copied());
                return (failed, true);
            }

            emit(
                on_log,
                Severity::Info,
                format!("Fetching {} bars for {}", request.bar_count, request.symbol),
            );

            let mut on_attempt_failed = |attempt: Attempt, error: &str| {
                emit(
                    on_log,
                    Severity::Warning,
                    format!("Attempt {attempt} for {} failed: {error}", request.symbol),
                );
            };
            let outcome = self.fetcher.fetch_one(request, &mut on_attempt_failed).await;
            match outcome {
                FetchOutcome::Fetched(series) => {
                    emit(
                        on_log,
                        Severity::Success,
                        format!("Downloaded {} bars for {}", series.len(), request.symbol),
                    );
                    results.insert(request.symbol.clone(), series);
                }
                FetchOutcome::Failed { errors, .. } => {
                    emit(
                        on_log,
                        Severity::Error,
                        format!(
                            "Failed to download {} after {} attempts",
                            request.symbol,
                            errors.len()
                        ),
                    );
                    failed.push(request);
                }
            }

            on_done(index + 1);
        }

        (failed, false)
    }
}

impl fmt::Debug for BatchRetryCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRetryCoordinator")
            .field("settings", &self.settings)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn emit<L: FnMut(LogEvent)>(sink: &mut L, severity: Severity, message: impl Into<String>) {
    let event = LogEvent::new(severity, message);
    event.trace();
    sink(event);
}
