//! Bounded retry with exponential backoff around a single provider call.
//!
//! Transient errors are retried on a finite delay schedule
//! (`base * multiplier^attempt + jitter`). Everything else ends the call at once.
//! The caller only ever sees an [`Attempt`], never a raw [`ProviderError`].

use crate::config::RetryConfig;
use crate::provider::ProviderError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_retry::RetryIf;
use tracing::warn;

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Outcome of a provider call after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Resolved(T),
    /// Confirmed missing, never retried.
    Unavailable(String),
    /// Transient failures outlived the retry budget.
    Exhausted(String),
    /// Detection or credential problem; the run must stop.
    Blocked(String),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base: Duration,
    multiplier: f64,
    jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, multiplier: f64, jitter: Duration) -> Self {
        Self { max_retries, base, multiplier, jitter }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.backoff_base_ms),
            config.backoff_multiplier,
            Duration::from_millis(config.jitter_ms),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff before retry `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = self.base.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }

    /// One delay per permitted retry.
    pub fn schedule(&self) -> Vec<Duration> {
        let mut rng = rand::rng();
        (0..self.max_retries)
            .map(|attempt| {
                let jitter_ms = rng.random_range(0..=self.jitter.as_millis() as u64);
                self.backoff(attempt) + Duration::from_millis(jitter_ms)
            })
            .collect()
    }

    /// Run `op` until it succeeds, fails non-transiently, or the schedule runs out.
    pub async fn run<T, F, Fut>(&self, label: &str, op: F) -> Attempt<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max = self.max_retries;
        let mut retries = 0u32;

        let result = RetryIf::spawn(self.schedule(), op, |e: &ProviderError| {
            if !e.is_transient() || retries >= max {
                return false;
            }
            retries += 1;
            warn!("[Retry {}/{}] {}: {}", retries, max, label, e);
            true
        })
        .await;

        match result {
            Ok(v) => Attempt::Resolved(v),
            Err(ProviderError::Transient(msg)) => {
                warn!("[Max retries exhausted] {}: {}", label, msg);
                Attempt::Exhausted(msg)
            }
            Err(ProviderError::Unavailable(msg)) => Attempt::Unavailable(msg),
            Err(ProviderError::Blocked(msg)) => Attempt::Blocked(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instant(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::ZERO, 1.5, Duration::ZERO)
    }

    /// Fails with `errors` in order, then succeeds.
    async fn scripted(calls: &AtomicU32, errors: &[ProviderError]) -> Result<u32, ProviderError> {
        let n = calls.fetch_add(1, Ordering::SeqCst) as usize;
        match errors.get(n) {
            Some(e) => Err(e.clone()),
            None => Ok(n as u32),
        }
    }

    #[test]
    fn test_backoff_is_exponential() {
        let policy = RetryPolicy::new(3, Duration::from_millis(200), 2.0, Duration::ZERO);
        assert_eq!(policy.backoff(0), Duration::from_millis(200));
        assert_eq!(policy.backoff(1), Duration::from_millis(400));
        assert_eq!(policy.backoff(2), Duration::from_millis(800));
        assert_eq!(policy.schedule().len(), 3);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(200, Duration::from_secs(1), 10.0, Duration::ZERO);
        assert_eq!(policy.backoff(150), MAX_BACKOFF);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::new(20, Duration::from_millis(10), 1.0, Duration::from_millis(5));
        for d in policy.schedule() {
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(15));
        }
    }

    #[tokio::test]
    async fn test_transient_then_success_resolves() {
        let calls = AtomicU32::new(0);
        let errors = [
            ProviderError::Transient("timeout".into()),
            ProviderError::Transient("reset".into()),
        ];
        let out = instant(3).run("C", || scripted(&calls, &errors)).await;
        assert_eq!(out, Attempt::Resolved(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let errors = vec![ProviderError::Transient("timeout".into()); 10];
        let out = instant(2).run("D", || scripted(&calls, &errors)).await;
        assert_eq!(out, Attempt::Exhausted("timeout".into()));
        // first try + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_blocked_short_circuits() {
        let calls = AtomicU32::new(0);
        let errors = [ProviderError::Blocked("captcha".into())];
        let out = instant(3).run("E", || scripted(&calls, &errors)).await;
        assert_eq!(out, Attempt::Blocked("captcha".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_is_not_retried() {
        let calls = AtomicU32::new(0);
        let errors = [ProviderError::Unavailable("private".into())];
        let out = instant(3).run("F", || scripted(&calls, &errors)).await;
        assert_eq!(out, Attempt::Unavailable("private".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_retries_fails_fast() {
        let calls = AtomicU32::new(0);
        let errors = [ProviderError::Transient("timeout".into())];
        let out = instant(0).run("G", || scripted(&calls, &errors)).await;
        tokio_test::assert_ok!(match out {
            Attempt::Exhausted(_) => Ok(()),
            other => Err(other),
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
