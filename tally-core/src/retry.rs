//! Bounded exponential backoff for store calls.
//!
//! ```text
//! backoff(attempt) = min(initial_backoff * multiplier^attempt, max_backoff)
//!
//! defaults: 5 retries, 100ms, 200ms, 400ms, 800ms, 1.6s (capped at 30s)
//! ```
//!
//! Only errors for which [`crate::Error::is_transient`] holds are retried.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{metrics, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-indexed).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(backoff_ms as u64).min(self.max_backoff)
    }
}

/// Run `operation` until it succeeds, fails permanently, or the retry budget is spent.
///
/// `op` labels the call in logs and in `tally_io_retries_total` / `tally_io_failures_total`.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, op: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(v) => {
                if attempt > 0 {
                    debug!(op, attempt = attempt + 1, "succeeded after retry");
                }
                return Ok(v);
            }
            Err(e) if !e.is_transient() => {
                warn!(op, error = %e, "permanent error, giving up");
                metrics::IO_FAILURES.with_label_values(&[op]).inc();
                return Err(e);
            }
            Err(e) if attempt >= policy.max_retries => {
                warn!(op, attempt = attempt + 1, max_retries = policy.max_retries, error = %e, "retries exhausted");
                metrics::IO_FAILURES.with_label_values(&[op]).inc();
                return Err(e);
            }
            Err(e) => {
                let backoff = policy.backoff(attempt);
                warn!(op, attempt = attempt + 1, backoff_ms = backoff.as_millis() as u64, error = %e, "transient error, backing off");
                metrics::IO_RETRIES.with_label_values(&[op]).inc();
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
