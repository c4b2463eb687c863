//! Bounded exponential backoff for provider calls

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::metrics::PROVIDER_RETRIES;
use crate::provider::ProviderError;

/// How often and how patiently a failed model call is repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first call included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Last error once every attempt failed (or the error was not retryable)
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub error: ProviderError,
}

impl RetryPolicy {
    /// Never retry
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Wait before attempt `attempt + 1`, given the error from `attempt`
    ///
    /// A server-supplied retry hint wins over the computed backoff but is
    /// still capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32, error: &ProviderError) -> Duration {
        let computed = match error.retry_after_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1))),
        };
        computed.min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<(T, u32), RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.run_until(None, op).await
    }

    /// Like [`RetryPolicy::run`], but never sleeps past `deadline`
    pub async fn run_until<T, F, Fut>(
        &self,
        deadline: Option<Instant>,
        mut op: F,
    ) -> Result<(T, u32), RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(error)
                    if error.is_retryable()
                        && attempt < max_attempts
                        && deadline.map_or(true, |d| {
                            Instant::now() + self.delay_for(attempt, &error) < d
                        }) =>
                {
                    let wait = self.delay_for(attempt, &error);
                    PROVIDER_RETRIES
                        .with_label_values(&[&format!("{:?}", error.kind)])
                        .inc();
                    info!(
                        attempt,
                        max = max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        kind = ?error.kind,
                        "Provider call failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(error) => {
                    warn!(attempt, kind = ?error.kind, error = %error, "Provider call failed");
                    return Err(RetryExhausted {
                        attempts: attempt,
                        error,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        let err = ProviderError::new(ProviderErrorKind::ServerError, "boom");
        assert_eq!(policy.delay_for(1, &err), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2, &err), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3, &err), Duration::from_secs(2));
        assert_eq!(policy.delay_for(10, &err), Duration::from_secs(8));
    }

    #[test]
    fn test_retry_after_honoured() {
        let policy = RetryPolicy::default();
        let mut err = ProviderError::new(ProviderErrorKind::RateLimit, "slow down");
        err.retry_after_secs = Some(3);
        assert_eq!(policy.delay_for(1, &err), Duration::from_secs(3));
        err.retry_after_secs = Some(60);
        assert_eq!(policy.delay_for(1, &err), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let (value, attempts) = fast()
            .run(|_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ProviderError::new(ProviderErrorKind::Network, "reset"))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, "ok");
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ProviderError::new(ProviderErrorKind::Timeout, "slow")) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_past_deadline() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
        };
        let err = policy
            .run_until(Some(Instant::now() + Duration::from_millis(100)), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ProviderError::new(ProviderErrorKind::ServerError, "down")) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ProviderError::from_status(401, "bad key")) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(err.error.kind, ProviderErrorKind::Auth);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
