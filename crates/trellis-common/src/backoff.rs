//! Per-object requeue backoff for controllers
//!
//! kube-runtime's error policy is stateless, so consecutive failures are
//! counted here, keyed by `namespace/name`, and cleared on the next
//! successful pass.

use std::time::Duration;

use dashmap::DashMap;
use kube::runtime::controller::Action;
use tracing::debug;

use crate::error::{Error, RetryClass};
use crate::retry::RetryConfig;

/// Tracks consecutive reconcile failures per object
#[derive(Debug)]
pub struct BackoffTracker {
    failures: DashMap<String, u32>,
    config: RetryConfig,
}

impl Default for BackoffTracker {
    fn default() -> Self {
        Self::new(RetryConfig::reconcile())
    }
}

impl BackoffTracker {
    /// Create a tracker with the given delay schedule
    pub fn new(config: RetryConfig) -> Self {
        Self {
            failures: DashMap::new(),
            config,
        }
    }

    /// Record a failure and return the delay before the next attempt
    pub fn record_failure(&self, key: &str) -> Duration {
        let mut entry = self.failures.entry(key.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
        self.config.delay_for_attempt(*entry)
    }

    /// Forget failures after a successful pass
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Consecutive failures recorded for a key
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|v| *v).unwrap_or(0)
    }

    /// Requeue action for a failed pass
    ///
    /// Conflicts re-run immediately without counting as a failure;
    /// errors that need a spec edit wait for the next change event.
    pub fn action_for(&self, key: &str, error: &Error) -> Action {
        match error.retry_class() {
            RetryClass::Immediate => Action::requeue(Duration::ZERO),
            RetryClass::AwaitChange => {
                self.reset(key);
                Action::await_change()
            }
            RetryClass::Backoff => {
                let delay = self.record_failure(key);
                debug!(
                    object = %key,
                    failures = self.failures(key),
                    delay_secs = delay.as_secs(),
                    "backing off"
                );
                Action::requeue(delay)
            }
        }
    }
}
