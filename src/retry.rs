//! Retry and polling utilities
//!
//! Exponential backoff for relay submissions and a bounded poll loop for
//! waiting on store or chain state. Both sleep between attempts.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};

/// Submission retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration after a given failed attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Execute `operation` until it succeeds, fails with a non-retryable error,
/// or the attempt budget is spent. The closure receives the 0-based attempt.
pub async fn with_retry<F, T, Fut>(config: &RetryConfig, mut operation: F) -> BridgeResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = BridgeResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if !e.is_retryable() || !config.should_retry(attempt) {
                    return Err(e);
                }
                let backoff = config.backoff_for_attempt(attempt - 1);
                warn!(
                    attempt,
                    max = config.max_attempts,
                    ?backoff,
                    error = %e,
                    "Retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Poll `check` every `interval` until it yields a value or `timeout` elapses.
///
/// `check` returning `Ok(None)` means "not yet"; errors end the wait early.
/// The interval is clamped to at least 1ms so the loop never spins.
pub async fn wait_for<F, T, Fut>(interval: Duration, timeout: Duration, mut check: F) -> BridgeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BridgeResult<Option<T>>>,
{
    let interval = interval.max(Duration::from_millis(1));
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        let now = Instant::now();
        if now >= deadline {
            debug!(timeout_ms = timeout.as_millis() as u64, "Wait timed out");
            return Err(BridgeError::Timeout(timeout.as_millis() as u64));
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
