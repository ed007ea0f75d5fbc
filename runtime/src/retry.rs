//! Retry with jittered backoff for transient contention.
//!
//! Conflicting writers on one account either wait on a row lock or lose a
//! version compare-and-set. Both surface as transient errors, and the fix is
//! the same: back off for a random duration so colliding callers spread out,
//! then try again.
//!
//! # Example
//!
//! ```rust
//! use quota_ledger_runtime::retry::{RetryPolicy, retry_with_jitter};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .backoff_range(Duration::from_millis(1), Duration::from_millis(5))
//!     .build();
//!
//! let result = retry_with_jitter(
//!     &policy,
//!     || async { Ok::<_, String>(42) },
//!     |err: &String| err.contains("conflict"),
//! )
//! .await?;
//! assert_eq!(result, 42);
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(10);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(50);

/// How many times to attempt an operation and how long to sleep between tries.
///
/// # Default Values
///
/// - `max_attempts`: 5 (total attempts, not retries)
/// - `min_backoff`: 10ms
/// - `max_backoff`: 50ms
///
/// The sleep before each retry is drawn uniformly from
/// `[min_backoff, max_backoff]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Create a policy, normalizing degenerate input.
    ///
    /// `max_attempts == 0` becomes 1, and an inverted range has its bounds swapped.
    #[must_use]
    pub const fn new(max_attempts: u32, min_backoff: Duration, max_backoff: Duration) -> Self {
        let max_attempts = if max_attempts == 0 { 1 } else { max_attempts };
        let (min_backoff, max_backoff) = if min_backoff.as_nanos() > max_backoff.as_nanos() {
            (max_backoff, min_backoff)
        } else {
            (min_backoff, max_backoff)
        };
        Self {
            max_attempts,
            min_backoff,
            max_backoff,
        }
    }

    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            min_backoff: None,
            max_backoff: None,
        }
    }

    /// Total number of attempts, at least 1.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Lower bound of the backoff range.
    #[must_use]
    pub const fn min_backoff(&self) -> Duration {
        self.min_backoff
    }

    /// Upper bound of the backoff range.
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Draw a backoff duration uniformly from the configured range.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min_backoff == self.max_backoff {
            return self.min_backoff;
        }
        rng.gen_range(self.min_backoff..=self.max_backoff)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    min_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Set total number of attempts.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set both bounds of the backoff range.
    #[must_use]
    pub const fn backoff_range(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = Some(min);
        self.max_backoff = Some(max);
        self
    }

    /// Set the lower backoff bound.
    #[must_use]
    pub const fn min_backoff(mut self, delay: Duration) -> Self {
        self.min_backoff = Some(delay);
        self
    }

    /// Set the upper backoff bound.
    #[must_use]
    pub const fn max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = Some(delay);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            self.min_backoff.unwrap_or(DEFAULT_MIN_BACKOFF),
            self.max_backoff.unwrap_or(DEFAULT_MAX_BACKOFF),
        )
    }
}

/// Why [`retry_with_jitter`] stopped without a result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The operation failed with an error the predicate refused to retry.
    #[error("{0}")]
    Aborted(E),

    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error from the final attempt
        last: E,
    },
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// runs out of attempts.
///
/// Sleeps a jittered [`RetryPolicy`] delay between attempts. `operation`
/// must be safe to repeat.
///
/// # Errors
///
/// - [`RetryError::Aborted`] with the first non-retryable error
/// - [`RetryError::Exhausted`] with the last error once `max_attempts` is spent
pub async fn retry_with_jitter<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt: u32 = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    RetryMetrics::record_success();
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            },
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::debug!(attempt, error = %err, "Error is not retryable, failing immediately");
                    return Err(RetryError::Aborted(err));
                }

                if attempt >= policy.max_attempts() {
                    RetryMetrics::record_exhausted();
                    tracing::error!(attempt, error = %err, "Operation failed after max attempts");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }

                let delay = policy.jittered_delay(&mut rand::thread_rng());
                RetryMetrics::record_attempt();
                tracing::warn!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Transient failure, retrying"
                );

                sleep(delay).await;
                attempt += 1;
            },
        }
    }
}
