//! Bounded retries with exponential backoff and jitter.
//!
//! The executor knows nothing about the operation it runs. Errors decide for
//! themselves whether another attempt could help via [`Retryable`].

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use streamgate_core::{RetryPolicy, UpstreamError, MAX_JITTER_FACTOR, MIN_JITTER_FACTOR};

/// Classifies an error as worth retrying.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for UpstreamError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Successful result and the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// The last error once retries are exhausted or a terminal error was hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
}

/// Delay to sleep after the failed attempt `attempt_index` (0-based).
///
/// The exponential base is capped at `max_delay`, scaled by a uniform factor
/// in `[0.5, 1.5]` when jitter is on, and capped at `max_delay` again.
pub fn backoff_delay(policy: &RetryPolicy, attempt_index: u32) -> Duration {
    let base = policy.base_delay(attempt_index);
    if !policy.jitter {
        return base;
    }
    let factor: f64 = rand::rng().random_range(MIN_JITTER_FACTOR..=MAX_JITTER_FACTOR);
    base.mul_f64(factor).min(policy.max_delay)
}

/// Run `operation` until it succeeds, fails terminally, or runs out of
/// attempts. The closure receives the 1-based attempt number.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<Retried<T>, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                })
            }
            Err(error) if !error.is_retryable() => {
                tracing::debug!(attempt, error = %error, "Terminal error, not retrying");
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                });
            }
            Err(error) if attempt >= max_attempts => {
                tracing::warn!(attempts = attempt, error = %error, "Retries exhausted");
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                });
            }
            Err(error) => {
                let delay = backoff_delay(policy, attempt - 1);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
