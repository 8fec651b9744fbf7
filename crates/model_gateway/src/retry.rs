//! Retry with bounded exponential backoff and jitter.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use llm_dispatch_core::{config::RetryConfig, RequestContext, Result};

/// Executes an operation, retrying classified retryable failures.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff before retry `attempt` (0-based), without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exp = self.config.factor.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let millis = (self.config.initial_backoff_ms as f64 * exp).min(self.config.max_backoff_ms as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// Backoff before retry `attempt`, perturbed by ±`jitter`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        base.mul_f64(factor.max(0.0))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// exhausts `max_retries`, or the context ends.
    ///
    /// The closure receives the 0-based attempt number.
    pub async fn run<T, F, Fut>(&self, ctx: &RequestContext, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= self.config.max_retries {
                return Err(err);
            }

            let wait = self.backoff(attempt);
            tracing::debug!(
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                backoff_ms = wait.as_millis() as u64,
                error = %err,
                "Retrying after retryable error"
            );
            ctx.sleep(wait).await?;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm_dispatch_core::{Error, Provider, ProviderError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            factor: 2.0,
            jitter: 0.0,
        })
    }

    #[test]
    fn test_backoff_progression() {
        let policy = policy(5);
        assert_eq!(policy.base_backoff(0), Duration::from_millis(100));
        assert_eq!(policy.base_backoff(1), Duration::from_millis(200));
        assert_eq!(policy.base_backoff(2), Duration::from_millis(400));
        assert_eq!(policy.base_backoff(3), Duration::from_millis(800));
        assert_eq!(policy.base_backoff(4), Duration::from_millis(1_000)); // Capped
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::new(RetryConfig {
            jitter: 0.25,
            ..policy(3).config().clone()
        });
        for _ in 0..100 {
            let wait = policy.backoff(1);
            assert!(wait >= Duration::from_millis(150), "{:?}", wait);
            assert!(wait <= Duration::from_millis(250), "{:?}", wait);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_error_is_retried_until_exhausted() {
        let calls = AtomicU32::new(0);
        let ctx = RequestContext::new();

        let result: Result<()> = policy(2)
            .run(&ctx, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::rate_limit(Provider::OpenAi, "slow down").into()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.unwrap_err().is_kind(llm_dispatch_core::ErrorKind::RateLimit));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let ctx = RequestContext::new();

        let result: Result<()> = policy(2)
            .run(&ctx, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::invalid_response(Provider::Gemini, "bad json").into()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failure() {
        let ctx = RequestContext::new();
        let started = tokio::time::Instant::now();

        let value = policy(3)
            .run(&ctx, |attempt| async move {
                if attempt < 2 {
                    Err(ProviderError::timeout(Provider::Mistral, "slow").into())
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        // 100ms + 200ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_millis(310));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_backoff() {
        let calls = AtomicU32::new(0);
        let ctx = RequestContext::with_timeout(Duration::from_millis(150));

        let result: Result<()> = policy(5)
            .run(&ctx, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::timeout(Provider::OpenAi, "slow").into()) }
            })
            .await;

        // Attempts at t=0 and t=100ms; the 200ms wait is cut short at 150ms.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(result, Err(Error::DeadlineExceeded)));
    }
}
