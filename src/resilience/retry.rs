//! Retry-on-conflict executor for serializable transactions.
//!
//! A unit of work is a closure that runs one complete transaction attempt
//! (begin → work → commit). When the attempt fails with a serialization or
//! deadlock conflict, [`with_retry`] sleeps `base_delay * 2^attempt` plus
//! jitter and runs the closure again. Any other error is returned as is.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Errors that can tell a transient transaction conflict apart from
/// everything else.
pub trait Retryable {
    /// Returns `true` for serialization failures and deadlocks.
    fn is_conflict(&self) -> bool;
}

/// Backoff configuration for [`with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Builds a policy from a retry count and base delay in milliseconds.
    #[must_use]
    pub const fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    /// Exponential part of the delay before retry number `attempt + 1`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1_u32 << attempt.min(16))
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let jitter_cap = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let jitter = rand::rng().random_range(0..=jitter_cap);
        self.backoff(attempt)
            .saturating_add(Duration::from_millis(jitter))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 25)
    }
}

/// Runs `work` until it succeeds, fails with a non-conflict error, or the
/// retry budget is spent.
///
/// The closure receives the zero-based attempt number.
///
/// # Errors
///
/// Returns the last error from `work`: immediately for non-conflict
/// errors, after `max_retries` retries for conflicts.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, mut work: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 0_u32;
    loop {
        match work(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempt, "transaction succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_conflict() && attempt < policy.max_retries => {
                let delay = policy.delay_with_jitter(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "transaction conflict; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_conflict() {
                    tracing::warn!(attempts = attempt + 1, error = %e, "retry budget exhausted");
                }
                return Err(e);
            }
        }
    }
}
