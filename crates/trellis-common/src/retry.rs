//! Delay schedules and bounded in-process retry
//!
//! Reconcile passes never retry in-process; they requeue through
//! [`crate::backoff::BackoffTracker`], which uses [`RetryConfig::reconcile`].
//! Startup work such as CRD installation uses [`retry_with_backoff`] to ride
//! out a briefly unavailable API server, and gives up at once on errors that
//! no retry will fix.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Exponential delay schedule
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Attempts before giving up (0 = unbounded)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Growth factor per failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default schedule bounded to `attempts` tries
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Requeue schedule for failed reconcile passes: 5s doubling to 5m
    pub fn reconcile() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }

    /// Un-jittered delay after the given failure (1-based), capped at `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Run `operation` until it succeeds, retrying transient failures
///
/// Errors for which [`Error::is_retryable`] is false are returned on the
/// first occurrence. Delays carry 0.5x-1.5x jitter.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let e = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !e.is_retryable() {
            error!(operation = %operation_name, error = %e, "operation failed permanently");
            return Err(e);
        }
        if config.exhausted(attempt) {
            error!(operation = %operation_name, attempt, error = %e, "operation failed after max retries");
            return Err(e);
        }

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = config.delay_for_attempt(attempt).mul_f64(jitter);
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = delay.as_millis(),
            "operation failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
