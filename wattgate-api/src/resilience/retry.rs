//! Bounded retries with exponential backoff for upstream calls.

use std::future::Future;
use std::time::Duration;
use wattgate_core::UpstreamResult;

use crate::telemetry::metrics;

/// Largest exponent applied to the base delay.
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based):
    /// `base_delay * 2^(attempt - 1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Runs upstream operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Invoke `operation` until it succeeds, fails with a non-retryable
    /// status, or attempts run out. The last failure is returned as a value.
    ///
    /// `operation` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, endpoint: &str, mut operation: F) -> UpstreamResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = UpstreamResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(failure) if failure.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        endpoint = endpoint,
                        status = failure.status,
                        attempt = attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "transient upstream failure, backing off"
                    );
                    if let Some(m) = metrics() {
                        m.record_retry(endpoint, failure.status);
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(failure) => {
                    if failure.is_retryable() {
                        tracing::warn!(
                            endpoint = endpoint,
                            status = failure.status,
                            attempts = attempt,
                            "upstream retries exhausted"
                        );
                    }
                    return Err(failure);
                }
            }
        }
    }
}
