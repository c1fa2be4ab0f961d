//! Bounded retry with per-attempt timeout and exponential backoff

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::errors::{EngineError, Result};

/// Retry policy applied at every suspension point of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each time
    pub base_delay: Duration,
    /// Upper bound on a single backoff delay
    pub max_delay: Duration,
    /// Budget for each individual attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1` (attempts are 1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Same policy with a different attempt cap
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt cap is hit
    ///
    /// Each attempt is bounded by `attempt_timeout`; an elapsed attempt is
    /// reported as `EngineError::Timeout` and retried.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match timeout(self.attempt_timeout, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout(format!(
                    "{} exceeded {:?}",
                    operation, self.attempt_timeout
                ))),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {:?}",
                        operation, attempt, self.max_attempts, e, delay
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!("{} failed after {} attempts: {}", operation, attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            attempt_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = fast_policy()
            .run("flaky", move |_| async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(EngineError::transient("test", "first call fails"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = fast_policy()
            .run("invalid", move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::Validation("nope".into()))
            })
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_attempts_time_out_until_cap() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = fast_policy()
            .run("slow", move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(EngineError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
