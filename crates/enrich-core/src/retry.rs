//! Bounded retries with exponential backoff
//!
//! The pre-jitter delay after failed attempt `n` (0-based) is
//! `base * factor^n`, multiplied again for transient service errors and
//! capped at `max_delay`. A random jitter of up to `jitter * delay` is added
//! on top. Permanent failures end the loop after the attempt that produced
//! them.

use crate::config::RetryConfig;
use crate::error::GenerationError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Attempts including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Growth per attempt
    pub factor: f64,
    /// Extra multiplier for transient service errors
    pub transient_multiplier: f64,
    /// Jitter bound as a fraction of the delay
    pub jitter: f64,
    /// Ceiling for any delay
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Policy from configuration
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            factor: config.factor,
            transient_multiplier: config.transient_multiplier,
            jitter: config.jitter,
            max_delay: config.max_delay(),
        }
    }

    /// With maximum attempts
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// With base delay
    #[inline]
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// With jitter fraction
    #[inline]
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt, without jitter
    #[must_use]
    pub fn base_delay_after(&self, failed_attempt: u32, error: &GenerationError) -> Duration {
        let exponent = i32::try_from(failed_attempt).unwrap_or(i32::MAX);
        let mut secs = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        if error.is_transient() {
            secs *= self.transient_multiplier;
        }
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Delay before the next attempt, with jitter
    #[must_use]
    pub fn delay_after(&self, failed_attempt: u32, error: &GenerationError) -> Duration {
        let base = self.base_delay_after(failed_attempt, error);
        let bound = base.as_secs_f64() * self.jitter;
        if bound <= 0.0 {
            return base;
        }
        let extra = rand::rng().random_range(0.0..=bound);
        base + Duration::try_from_secs_f64(extra).unwrap_or_default()
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// A work unit that could not be completed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{label} failed after {attempts} attempt(s): {last_error}")]
pub struct RetryFailure {
    /// Unit label
    pub label: String,
    /// Attempts made
    pub attempts: u32,
    /// Error of the final attempt
    pub last_error: GenerationError,
}

impl RetryFailure {
    /// Whether the unit ended on a non-retryable error
    #[inline]
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        !self.last_error.is_retryable()
    }
}

/// Runs one work unit with retries
#[derive(Debug, Clone, Default)]
pub struct RetryDispatcher {
    policy: BackoffPolicy,
}

impl RetryDispatcher {
    /// Create a dispatcher
    #[inline]
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    /// Backoff policy
    #[inline]
    #[must_use]
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails permanently or attempts run out
    ///
    /// `operation` receives the 0-based attempt index.
    ///
    /// # Errors
    /// [`RetryFailure`] carrying the last error; callers skip the unit.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(label, attempts = attempt + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let attempts = attempt + 1;
            if !error.is_retryable() {
                warn!(label, kind = error.kind(), error = %error, "permanent failure; not retrying");
                return Err(RetryFailure {
                    label: label.to_string(),
                    attempts,
                    last_error: error,
                });
            }
            if attempts >= max_attempts {
                warn!(label, attempts, kind = error.kind(), error = %error, "attempts exhausted");
                return Err(RetryFailure {
                    label: label.to_string(),
                    attempts,
                    last_error: error,
                });
            }

            let delay = self.policy.delay_after(attempt, &error);
            warn!(
                label,
                attempt = attempts,
                max_attempts,
                kind = error.kind(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "attempt failed; backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(attempts: u32) -> BackoffPolicy {
        BackoffPolicy::default()
            .with_max_attempts(attempts)
            .with_base_delay(Duration::from_millis(100))
    }

    #[test]
    fn pre_jitter_delay_strictly_increases() {
        let policy = BackoffPolicy::default();
        let transient = GenerationError::TransientServiceError("503".into());
        let delays: Vec<_> = (0..5).map(|n| policy.base_delay_after(n, &transient)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] < pair[1], "{delays:?}");
        }
        assert_eq!(delays[0], Duration::from_secs(10));
    }

    #[test]
    fn transient_backs_off_longer() {
        let policy = BackoffPolicy::default();
        let transient = GenerationError::TransientServiceError("429".into());
        let malformed = GenerationError::MalformedOutput("x".into());
        assert!(policy.base_delay_after(1, &transient) > policy.base_delay_after(1, &malformed));
    }

    #[test]
    fn jitter_is_bounded() {
        let policy = BackoffPolicy::default().with_jitter(0.5);
        let error = GenerationError::MalformedOutput("x".into());
        let base = policy.base_delay_after(2, &error);
        for _ in 0..100 {
            let delay = policy.delay_after(2, &error);
            assert!(delay >= base);
            assert!(delay <= base.mul_f64(1.5));
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy::default();
        let error = GenerationError::TransientServiceError("x".into());
        assert_eq!(policy.base_delay_after(40, &error), policy.max_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_short_circuits() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = RetryDispatcher::new(fast_policy(5));

        let counter = Arc::clone(&calls);
        let result: Result<(), _> = dispatcher
            .run("item", |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(GenerationError::Blocked("SAFETY".into()))
                }
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.attempts, 1);
        assert!(failure.is_permanent());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_retries_up_to_max() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = RetryDispatcher::new(fast_policy(4));

        let counter = Arc::clone(&calls);
        let result: Result<(), _> = dispatcher
            .run("batch 0", |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(GenerationError::TransientServiceError("503".into()))
                }
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(failure.attempts, 4);
        assert!(!failure.is_permanent());
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_failures() {
        let dispatcher = RetryDispatcher::new(fast_policy(5));
        let value = dispatcher
            .run("item", |attempt| async move {
                if attempt < 2 {
                    Err(GenerationError::IncompleteOutput("MAX_TOKENS".into()))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_between_attempts() {
        let policy = fast_policy(3).with_jitter(0.0);
        let dispatcher = RetryDispatcher::new(policy);
        let started = tokio::time::Instant::now();

        let _: Result<(), _> = dispatcher
            .run("item", |_| async {
                Err(GenerationError::MalformedOutput("bad".into()))
            })
            .await;

        // 100ms after the first failure, 200ms after the second
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(350), "{elapsed:?}");
    }
}
