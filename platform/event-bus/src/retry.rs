//! Caller-side retry with exponential backoff
//!
//! The publisher never retries on its own: whoever triggered the domain action
//! decides whether a failed publish is worth another attempt. This module is
//! what such callers use.
//!
//! The consumer side does not use it either. A failed handler leaves the
//! message for the queue to redeliver, which is the consumer's retry.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Initial backoff duration (doubles on each retry)
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Retry a fallible async operation with exponential backoff
///
/// Every error is considered retryable. Use [`retry_with_backoff_if`] when some
/// failures are final (e.g. an oversize payload).
///
/// # Example
/// ```rust
/// use event_bus::retry::{retry_with_backoff, RetryConfig};
///
/// # async fn example() -> Result<(), String> {
/// let config = RetryConfig::default();
/// let result = retry_with_backoff(
///     || async { Ok::<_, String>(42) },
///     &config,
///     "publish_lead_created"
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Send,
{
    retry_with_backoff_if(operation, config, context, |_| true).await
}

/// Like [`retry_with_backoff`], but stops at the first error `is_retryable` rejects
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    operation: F,
    config: &RetryConfig,
    context: &str,
    is_retryable: P,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Send,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_backoff;
    let mut attempt = 1;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(context = %context, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !is_retryable(&err) {
            warn!(context = %context, attempt, error = %err, "Giving up on non-retryable error");
            return Err(err);
        }

        if attempt >= max_attempts {
            warn!(context = %context, attempts = attempt, error = %err, "Giving up after max attempts");
            return Err(err);
        }

        warn!(
            context = %context,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );

        sleep(delay).await;
        delay = (delay * 2).min(config.max_backoff);
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_succeeds_first_attempt() {
        let config = RetryConfig::default();
        let result = retry_with_backoff(|| async { Ok::<_, String>(42) }, &config, "publish").await;

        assert_eq!(result, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let config = RetryConfig::default();
        let attempts = Arc::new(AtomicU32::new(0));

        let result = retry_with_backoff(
            || {
                let attempts = attempts.clone();
                async move {
                    let count = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(format!("transport unreachable (attempt {count})"))
                    } else {
                        Ok(42)
                    }
                }
            },
            &config,
            "publish",
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_non_retryable_error() {
        let config = RetryConfig::default();
        let attempts = Arc::new(AtomicU32::new(0));

        let result = retry_with_backoff_if(
            || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>("oversize")
                }
            },
            &config,
            "publish",
            |e| *e != "oversize",
        )
        .await;

        assert_eq!(result, Err("oversize"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff_is_capped() {
        let config = RetryConfig {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(25),
        };

        let start = tokio::time::Instant::now();
        let result = retry_with_backoff(
            || async { Err::<i32, _>("persistent error") },
            &config,
            "publish",
        )
        .await;

        // 10ms + 20ms + 25ms (capped)
        assert_eq!(result, Err("persistent error"));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(55));
        assert!(elapsed < Duration::from_millis(60));
    }
}
