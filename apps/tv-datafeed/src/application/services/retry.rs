//! Bounded Retry Policy
//!
//! One retry policy shared by every granularity that retries: opening a
//! connection, logging in, fetching a symbol, and batch retry rounds.
//! Attempts are separated by a fixed delay and the delay is cut short when
//! the cancellation token fires.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Position of an attempt within its policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    /// Total attempts allowed.
    pub max: u32,
}

impl Attempt {
    /// Whether no attempt follows this one.
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.number >= self.max
    }

    const fn next(self) -> Self {
        Self {
            number: self.number + 1,
            max: self.max,
        }
    }
}

impl std::fmt::Display for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.number, self.max)
    }
}

/// Error returned once a policy gives up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed.
    #[error("all {attempts} attempt(s) failed: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: E,
    },

    /// Cancelled while waiting to retry.
    #[error("cancelled after {attempts} attempt(s): {last}")]
    Cancelled {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: E,
    },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// Error from the final attempt.
    #[must_use]
    pub fn into_last(self) -> E {
        match self {
            Self::Exhausted { last, .. } | Self::Cancelled { last, .. } => last,
        }
    }
}

/// Bounded retry with a fixed delay between attempts.
///
/// # Example
///
/// ```rust
/// use tv_datafeed::application::services::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3, Duration::from_secs(1));
/// let numbers: Vec<u32> = policy.attempts().map(|a| a.number).collect();
/// assert_eq!(numbers, vec![1, 2, 3]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Create a policy allowing `max_attempts` tries, `delay` apart.
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Policy that tries exactly once.
    #[must_use]
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Maximum attempts.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay between attempts.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Iterate over the allowed attempts. Empty when `max_attempts` is 0.
    pub fn attempts(&self) -> impl Iterator<Item = Attempt> + use<> {
        let max = self.max_attempts;
        (1..=max).map(move |number| Attempt { number, max })
    }

    /// Sleep for the retry delay.
    ///
    /// Returns `false` if `cancel` fired first.
    pub async fn pause(&self, cancel: &CancellationToken) -> bool {
        pause(self.delay, cancel).await
    }

    /// Run `op` until it succeeds or the policy is exhausted.
    ///
    /// Always makes at least one attempt. `on_failure` is called after every
    /// failed attempt, before any delay.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error wrapped in [`RetryError`].
    pub async fn run<T, E, F, Fut, H>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        mut on_failure: H,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        H: FnMut(Attempt, &E),
    {
        let mut attempt = Attempt {
            number: 1,
            max: self.max_attempts.max(1),
        };

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    on_failure(attempt, &err);

                    if attempt.is_last() {
                        return Err(RetryError::Exhausted {
                            attempts: attempt.number,
                            last: err,
                        });
                    }

                    tracing::debug!(
                        attempt = attempt.number,
                        delay_ms = self.delay.as_millis(),
                        "Retrying after delay"
                    );

                    if !self.pause(cancel).await {
                        return Err(RetryError::Cancelled {
                            attempts: attempt.number,
                            last: err,
                        });
                    }

                    attempt = attempt.next();
                }
            }
        }
    }
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// Returns `false` when cancelled, including when already cancelled.
pub async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if delay.is_zero() {
        return true;
    }

    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}
