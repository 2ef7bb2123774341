//! Bounded retry with backoff for short, contended operations.
//!
//! Used for identity-lock acquisition on user-driven calls and for the
//! read-after-write check of a partner's vote. Retries never hold a lock
//! across the sleep.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled on every further retry.
    #[serde(with = "crate::serde_millis")]
    pub base_delay: Duration,
    #[serde(with = "crate::serde_millis")]
    pub max_delay: Duration,
    /// Add up to 50% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Constant delay, no jitter.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

#[derive(Debug)]
pub struct RetryResult<T, E> {
    pub result: Result<T, E>,
    /// Attempts made (1 = no retries needed).
    pub attempts: u32,
    pub total_duration: Duration,
}

impl<T, E> RetryResult<T, E> {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Run `operation` until it succeeds or the retry budget is spent. The last
/// error is returned when every attempt fails.
pub async fn execute_with_retry_async<T, E, F, Fut>(
    config: &RetryConfig,
    mut operation: F,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                return RetryResult {
                    result: Ok(value),
                    attempts: attempt + 1,
                    total_duration: start.elapsed(),
                };
            }
            Err(error) if attempt >= config.max_retries => {
                return RetryResult {
                    result: Err(error),
                    attempts: attempt + 1,
                    total_duration: start.elapsed(),
                };
            }
            Err(_) => {
                tokio::time::sleep(calculate_delay(config, attempt)).await;
                attempt += 1;
            }
        }
    }
}

/// Exponential backoff capped at `max_delay`, plus optional jitter.
pub(crate) fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = u64::try_from(config.base_delay.as_millis()).unwrap_or(u64::MAX);
    let cap = u64::try_from(config.max_delay.as_millis()).unwrap_or(u64::MAX);
    let exponential = base.saturating_mul(2_u64.saturating_pow(attempt));
    let delay = exponential.min(cap);

    if config.jitter {
        let jitter = fastrand::u64(0..=delay / 2);
        Duration::from_millis(delay + jitter)
    } else {
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn fixed_config_never_grows() {
        let cfg = RetryConfig::fixed(5, Duration::from_millis(10));
        for attempt in 0..5 {
            assert_eq!(calculate_delay(&cfg, attempt), Duration::from_millis(10));
        }
    }

    #[test]
    fn backoff_is_capped() {
        let cfg = RetryConfig::default().with_jitter(false);
        assert_eq!(calculate_delay(&cfg, 0), Duration::from_millis(10));
        assert_eq!(calculate_delay(&cfg, 2), Duration::from_millis(40));
        assert_eq!(calculate_delay(&cfg, 30), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let cfg = RetryConfig::fixed(3, Duration::from_millis(1));
        let outcome = execute_with_retry_async(&cfg, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err("busy")
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_last_error_when_budget_is_spent() {
        let cfg = RetryConfig::fixed(2, Duration::from_millis(1));
        let outcome = execute_with_retry_async(&cfg, |attempt| async move {
            Err::<(), _>(attempt)
        })
        .await;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.into_result(), Err(2));
    }
}
