//! Bounded retry of asynchronous actions.
//!
//! [`try_until`] runs an action until it succeeds or the [`RetryPolicy`]
//! budget is spent. The action alone decides what counts as failure: a
//! transport error and a "not yet in the desired state" answer are treated
//! the same way.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{OnboardError, Result};

/// Retry budget for one [`try_until`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts allowed after the first one.
    pub max_retries: u32,
    /// Delay between two attempts, in milliseconds.
    pub retry_interval_ms: u64,
}

impl RetryPolicy {
    /// Create a new policy.
    #[must_use]
    pub const fn new(max_retries: u32, retry_interval_ms: u64) -> Self {
        Self {
            max_retries,
            retry_interval_ms,
        }
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub const fn once() -> Self {
        Self::new(0, 0)
    }

    /// Total number of attempts this policy allows.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay between attempts.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Run `action` until it succeeds or `policy` is exhausted.
///
/// The first attempt happens immediately. After a failure, if fewer than
/// `max_retries` retries have been made, the task sleeps for the retry
/// interval and tries again. With `max_retries == 0` exactly one attempt is
/// made and nothing waits.
///
/// # Errors
///
/// Returns [`OnboardError::RetryExhausted`] wrapping the last failure once
/// the budget is spent.
pub async fn try_until<T, F, Fut>(policy: &RetryPolicy, mut action: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match action().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "Retried action succeeded");
                }
                return Ok(value);
            }
            Err(err) if attempt < policy.max_attempts() => {
                tracing::debug!(
                    attempt,
                    max_retries = policy.max_retries,
                    error = %err,
                    "Attempt failed, will retry"
                );
                tokio::time::sleep(policy.interval()).await;
            }
            Err(err) => {
                tracing::warn!(attempts = attempt, error = %err, "Retry budget exhausted");
                return Err(OnboardError::RetryExhausted {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }
        }
    }
}
