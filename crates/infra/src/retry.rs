//! Bounded retry with exponential backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Substrings (lower-case) that mark an upstream error as transient.
pub const RETRYABLE_MARKERS: [&str; 4] = ["429", "rate", "timeout", "temporar"];

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Added once per prior retry to spread competing workers apart.
    pub jitter_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter_step: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, never sleeps.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            jitter_step: Duration::ZERO,
        }
    }

    /// Sleep following failed attempt `attempt` (1-indexed):
    /// `min(base * 2^(attempt-1) + jitter_step * (attempt-1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let n = attempt - 1;
        let exp = 2u32.checked_pow(n).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .saturating_mul(exp)
            .saturating_add(self.jitter_step.saturating_mul(n));
        delay.min(self.max_delay)
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Error returned by [`RetryEngine::run`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// The classifier rejected the error; no retry budget was spent on it.
    #[error("{0:#}")]
    NonRetryable(anyhow::Error),
    /// Every attempt failed with a retryable error.
    #[error("retries exhausted after {attempts} attempts: {last:#}")]
    Exhausted { attempts: u32, last: anyhow::Error },
}

impl RetryError {
    /// The upstream error that ended the run.
    pub fn last_error(&self) -> &anyhow::Error {
        match self {
            RetryError::NonRetryable(err) => err,
            RetryError::Exhausted { last, .. } => last,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

type Classifier = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Runs a fallible async operation under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryEngine {
    policy: RetryPolicy,
    classifier: Classifier,
}

impl std::fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryEngine")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            classifier: Arc::new(is_retryable),
        }
    }

    /// Replace the default substring classifier.
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `op` until it succeeds, fails with a non-retryable error, or
    /// the attempt ceiling is reached. Sleeps between attempts, never after
    /// the last one.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !(self.classifier)(&err) {
                return Err(RetryError::NonRetryable(err));
            }
            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.policy.delay_for_attempt(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %format!("{err:#}"), "retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Default classifier: substring match over the lower-cased error chain.
///
/// Known weak point: adapter error text decides retryability, so an adapter
/// that mentions "rate" in a permanent rejection gets retried.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    is_retryable_message(&format!("{err:#}"))
}

pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn default_schedule() {
        let p = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|a| p.delay_for_attempt(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1100, 2200, 4300, 5000]);
        assert_eq!(p.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(p.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn classifier_matches_markers() {
        assert!(is_retryable_message("HTTP 429 Too Many Requests"));
        assert!(is_retryable_message("Rate limited"));
        assert!(is_retryable_message("request TIMEOUT"));
        assert!(is_retryable_message("temporarily unavailable"));
        assert!(!is_retryable_message("invalid credentials"));
        assert!(!is_retryable_message("400 bad request"));
    }

    #[test]
    fn classifier_sees_context_chain() {
        let err = anyhow!("upstream said 429").context("linkedin publish failed");
        assert!(is_retryable(&err));
    }

    #[tokio::test(start_paused = true)]
    async fn always_retryable_runs_five_times() {
        let engine = RetryEngine::default();
        let calls = AtomicU32::new(0);
        let stamps = Mutex::new(Vec::new());
        let start = Instant::now();

        let result: Result<(), _> = engine
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                stamps.lock().unwrap().push(Instant::now() - start);
                async { Err(anyhow!("429 rate limited")) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert!(err.to_string().starts_with("retries exhausted after 5 attempts"));
        assert!(err.to_string().contains("429 rate limited"));
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let stamps = stamps.into_inner().unwrap();
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps.len(), 4);
        for pair in gaps.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(gaps.iter().all(|g| *g <= Duration::from_secs(5)));
        // No sleep after the final attempt.
        assert_eq!(Instant::now() - start, *stamps.last().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_returns_immediately() {
        let engine = RetryEngine::default();
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<(), _> = engine
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("invalid access token")) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::NonRetryable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let engine = RetryEngine::default();
        let calls = AtomicU32::new(0);

        let value = engine
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 4 {
                        Err(anyhow!("temporary failure #{n}"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_classifier() {
        let engine = RetryEngine::new(RetryPolicy::fixed(3, Duration::from_millis(10)))
            .with_classifier(|_| true);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = engine
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("bad request")) }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_capped(
            base_ms in 1u64..2_000,
            cap_ms in 1u64..10_000,
            jitter_ms in 0u64..500,
        ) {
            let policy = RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(cap_ms),
                jitter_step: Duration::from_millis(jitter_ms),
            };
            let mut prev = Duration::ZERO;
            for attempt in 1..=64 {
                let d = policy.delay_for_attempt(attempt);
                prop_assert!(d >= prev);
                prop_assert!(d <= policy.max_delay);
                prev = d;
            }
        }

        #[test]
        fn classifier_ignores_case(marker in prop::sample::select(RETRYABLE_MARKERS.to_vec()), upper in any::<bool>()) {
            let text = format!("upstream: {marker} happened");
            let text = if upper { text.to_uppercase() } else { text };
            prop_assert!(is_retryable_message(&text));
        }
    }
}
