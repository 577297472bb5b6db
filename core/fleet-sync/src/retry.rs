//! Bounded retry with exponential backoff for one-shot reads.
//!
//! The policy never runs the operation concurrently with itself: each attempt
//! is awaited to completion before the next delay starts. The last error is
//! returned verbatim once the budget is spent.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_DELAY_MS: u64 = 500;
const DEFAULT_MAX_DELAY_MS: u64 = 8_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Full jitter: each delay is drawn uniformly from `0..=computed`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: initial_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` attempts have failed. `operation` receives the
    /// 1-based attempt number.
    pub async fn attempt<T, E, F, Fut, R>(&self, mut operation: F, is_retryable: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !is_retryable(&err) {
                debug!(attempt, error = %err, "Non-retryable failure; giving up");
                return Err(err);
            }

            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %err, "Retry budget exhausted");
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retryable failure; backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Delay after the `failed_attempts`-th failure (1-based).
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let computed =
            compute_backoff_ms(self.initial_delay_ms, self.max_delay_ms, failed_attempts);
        if self.jitter && computed > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=computed))
        } else {
            Duration::from_millis(computed)
        }
    }
}

fn compute_backoff_ms(initial_ms: u64, max_ms: u64, failed_attempts: u32) -> u64 {
    let exponent = failed_attempts.saturating_sub(1).min(63);
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    initial_ms.saturating_mul(factor).min(max_ms.max(initial_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TestError {
        Transient(u32),
        Fatal,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Transient(n) => write!(f, "transient #{}", n),
                TestError::Fatal => write!(f, "fatal"),
            }
        }
    }

    fn retryable(err: &TestError) -> bool {
        matches!(err, TestError::Transient(_))
    }

    #[test]
    fn backoff_doubles_each_retry() {
        assert_eq!(compute_backoff_ms(100, 10_000, 1), 100);
        assert_eq!(compute_backoff_ms(100, 10_000, 2), 200);
        assert_eq!(compute_backoff_ms(100, 10_000, 3), 400);
        assert_eq!(compute_backoff_ms(100, 10_000, 4), 800);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(compute_backoff_ms(100, 1_000, 10), 1_000);
        assert_eq!(compute_backoff_ms(100, 1_000, 200), 1_000);
    }

    #[test]
    fn jittered_delay_never_exceeds_computed() {
        let policy = RetryPolicy {
            jitter: true,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            max_attempts: 5,
        };
        for attempt in 1..6 {
            assert!(policy.delay_for(attempt) <= Duration::from_millis(1_000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let started = Instant::now();

        let counter = Arc::clone(&calls);
        let result = policy
            .attempt(
                move |attempt| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if attempt < 3 {
                            Err(TestError::Transient(attempt))
                        } else {
                            Ok("value")
                        }
                    }
                },
                retryable,
            )
            .await;

        assert_eq!(result, Ok("value"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms after the first failure, 200ms after the second.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(310), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_fails_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_millis(100));

        let counter = Arc::clone(&calls);
        let result: Result<(), TestError> = policy
            .attempt(
                move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(TestError::Fatal)
                    }
                },
                retryable,
            )
            .await;

        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_last_error_after_budget() {
        let policy = RetryPolicy::new(4, Duration::from_millis(10));
        let result: Result<(), TestError> = policy
            .attempt(|attempt| async move { Err(TestError::Transient(attempt)) }, retryable)
            .await;

        assert_eq!(result, Err(TestError::Transient(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new(0, Duration::from_millis(10));
        let result: Result<(), TestError> = policy
            .attempt(|attempt| async move { Err(TestError::Transient(attempt)) }, retryable)
            .await;

        assert_eq!(result, Err(TestError::Transient(1)));
    }
}
