//! Retry strategy with exponential backoff and jitter.
//!
//! After failed attempt `n` the strategy sleeps
//! `min(max_delay, base_delay * 2^(n-1)) + jitter`, where jitter is drawn
//! uniformly from `[0, base_delay)`. A rate-limit error that names a
//! `retry_after` stretches the wait to at least that long (itself capped at
//! `max_delay`).

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{EngineError, Result, Retryability, classify};

/// State carried between attempts of one `execute` call
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// 1-based number of the attempt that just failed
    pub attempt_number: u32,
    pub last_error: EngineError,
    /// Sleep before the next attempt
    pub next_delay: Duration,
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStrategy {
    /// Retries after the first attempt; total attempts is `max_retries + 1`
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryStrategy {
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_retries, config.base_delay(), config.max_delay())
    }

    /// Single attempt, no sleeping
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Deterministic part of the delay after failed attempt `attempt`
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        2u32.checked_pow(attempt - 1)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Uniform random offset in `[0, base_delay)`
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn jitter(&self) -> Duration {
        let span = self.base_delay.as_nanos() as u64;
        if span == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..span))
    }

    fn next_delay(&self, attempt: u32, err: &EngineError) -> Duration {
        let delay = self.backoff_delay(attempt) + self.jitter();
        match err.retry_after() {
            Some(hint) => delay.max(hint.min(self.max_delay)),
            None => delay,
        }
    }

    /// Run `operation` with the default error classification
    ///
    /// # Errors
    ///
    /// A fatal error from the first failing attempt, or
    /// [`EngineError::RetriesExhausted`] wrapping the last retryable error.
    pub async fn execute_default<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute(operation, classify).await
    }

    /// Run `operation`, retrying errors that `classify_error` calls retryable
    ///
    /// # Errors
    ///
    /// A fatal error is returned unchanged on the attempt it occurs. Once the
    /// budget is spent the last error is returned inside
    /// [`EngineError::RetriesExhausted`].
    pub async fn execute<T, F, Fut, C>(&self, operation: F, classify_error: C) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&EngineError) -> Retryability,
    {
        self.execute_observed(operation, classify_error, |_| {}).await
    }

    /// Like [`execute`](Self::execute), reporting each scheduled retry to
    /// `on_retry` before sleeping
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn execute_observed<T, F, Fut, C, O>(
        &self,
        mut operation: F,
        classify_error: C,
        mut on_retry: O,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&EngineError) -> Retryability,
        O: FnMut(&RetryAttempt),
    {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if classify_error(&err) == Retryability::Fatal {
                debug!(attempt, error = %err, "Fatal error, not retrying");
                return Err(err);
            }

            if attempt > self.max_retries {
                warn!(attempts = attempt, error = %err, "Retries exhausted");
                return Err(EngineError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let state = RetryAttempt {
                attempt_number: attempt,
                next_delay: self.next_delay(attempt, &err),
                last_error: err,
            };
            warn!(
                attempt = state.attempt_number,
                delay_ms = state.next_delay.as_millis(),
                error = %state.last_error,
                "Retryable error, backing off"
            );
            on_retry(&state);
            tokio::time::sleep(state.next_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryStrategy {
        RetryStrategy::new(max_retries, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let strategy = RetryStrategy::new(10, Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(strategy.backoff_delay(0), Duration::ZERO);
        assert_eq!(strategy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(strategy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(strategy.backoff_delay(4), Duration::from_millis(800));
        assert_eq!(strategy.backoff_delay(5), Duration::from_millis(1000));
        assert_eq!(strategy.backoff_delay(64), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_below_base() {
        let strategy = RetryStrategy::new(3, Duration::from_millis(10), Duration::from_secs(1));
        for _ in 0..200 {
            assert!(strategy.jitter() < Duration::from_millis(10));
        }
        assert_eq!(RetryStrategy::no_retry().jitter(), Duration::ZERO);
    }

    #[test]
    fn test_retry_after_hint_is_capped() {
        let strategy = RetryStrategy::new(3, Duration::from_millis(1), Duration::from_millis(50));
        let err = EngineError::rate_limited("429", Some(Duration::from_secs(30)));
        let delay = strategy.next_delay(1, &err);
        assert!(delay >= Duration::from_millis(50));
        assert!(delay < Duration::from_millis(52));
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let result = fast(3).execute_default(|| async { Ok(42) }).await;
        assert_eq!(result.ok(), Some(42));
    }

    #[tokio::test]
    async fn test_eventual_success() {
        let attempts = Arc::new(AtomicU32::new(0));

        let result = fast(3)
            .execute_default(|| {
                let attempts = Arc::clone(&attempts);
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(EngineError::timeout("not yet"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.ok(), Some("done"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_observer_sees_monotonic_attempts() {
        let mut seen = Vec::new();

        let result: Result<()> = fast(3)
            .execute_observed(
                || async { Err(EngineError::network("down")) },
                classify,
                |state| seen.push((state.attempt_number, state.next_delay)),
            )
            .await;

        assert!(matches!(result, Err(EngineError::RetriesExhausted { attempts: 4, .. })));
        let numbers: Vec<u32> = seen.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(seen.iter().all(|(_, d)| *d < Duration::from_millis(6)));
    }

    #[tokio::test]
    async fn test_custom_classifier_can_make_anything_fatal() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast(5)
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(EngineError::rate_limited("429", None)) }
                },
                |_| Retryability::Fatal,
            )
            .await;

        assert!(matches!(result, Err(EngineError::Operation { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
