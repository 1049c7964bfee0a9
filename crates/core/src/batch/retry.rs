//! Retry policy and single-call retry helper.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::errors::{FailureKind, SyncError};

/// How failed items are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retry passes after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound on the backoff window.
    pub max_delay: Duration,
    /// Concurrency used for retry passes.
    pub retry_concurrency: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            retry_concurrency: 2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Upper bound of the jitter window for `attempt` (0-based):
    /// `min(max_delay, base_delay * 2^attempt)`.
    pub fn window(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Full-jitter delay in `[0, window(attempt)]`, but never shorter than a
    /// server-supplied `retry_after`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let window = self.window(attempt);
        let jittered = if window.is_zero() {
            Duration::ZERO
        } else {
            let millis = window.as_millis().min(u64::MAX as u128) as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
        };
        match retry_after {
            Some(floor) if floor > jittered => floor,
            _ => jittered,
        }
    }
}

/// Run one operation, retrying retryable failures under `policy`.
pub async fn with_retry<F, Fut, T>(
    operation: &str,
    policy: &RetryPolicy,
    mut f: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.kind() == FailureKind::Retryable && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt, err.retry_after());
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RemoteError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_window_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            retry_concurrency: 1,
        };
        assert_eq!(policy.window(0), Duration::from_millis(100));
        assert_eq!(policy.window(1), Duration::from_millis(200));
        assert_eq!(policy.window(3), Duration::from_millis(800));
        assert_eq!(policy.window(4), Duration::from_millis(1000));
        assert_eq!(policy.window(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_delay_within_window() {
        let policy = RetryPolicy::default();
        for attempt in 0..6 {
            for _ in 0..50 {
                let d = policy.delay_for(attempt, None);
                assert!(d <= policy.window(attempt));
            }
        }
    }

    #[test]
    fn test_delay_respects_retry_after() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            ..RetryPolicy::default()
        };
        for _ in 0..20 {
            assert!(policy.delay_for(0, Some(Duration::from_secs(2))) >= Duration::from_secs(2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_retries_transient_only() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            retry_concurrency: 1,
        };

        let calls = AtomicU32::new(0);
        let result = with_retry("flaky", &policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SyncError::from(RemoteError::TransientServer {
                        status: 502,
                        detail: "bad gateway".into(),
                    }))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("missing", &policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::from(RemoteError::NotFound { id: "x".into() })) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
