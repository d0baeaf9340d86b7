//! Bounded exponential backoff for store calls.

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::contract::StoreError;

/// Retry policy for transient store failures.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy with a fixed pause between attempts.
    pub fn fixed(max_attempts: usize, interval: Duration) -> Self {
        let ms = interval.as_millis() as u64;
        Self {
            max_attempts,
            initial_backoff_ms: ms,
            max_backoff_ms: ms,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry as i32).saturating_sub(1);
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let clamped = base.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(clamped as u64)
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the attempts
/// run out. Returns the last error in the latter two cases.
pub async fn with_retry<F, T, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() || attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = policy.delay_for_retry(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "[FETCH] Transient store error, retrying"
                );
                attempt += 1;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
