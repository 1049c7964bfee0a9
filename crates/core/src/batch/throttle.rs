//! Shared rate-limit backpressure.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::remote::RateLimitHints;

/// Pause applied when the server says it is close to the limit but gives no
/// explicit delay.
const NEAR_LIMIT_PAUSE: Duration = Duration::from_millis(250);

#[derive(Debug, Default)]
struct ThrottleState {
    paused_until: Option<Instant>,
    remaining: Option<u32>,
}

/// Records the rate-limit hints of every response. Callers `wait()` on it
/// before dispatching the next remote operation.
#[derive(Debug, Default)]
pub struct Throttle {
    state: Mutex<ThrottleState>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fold one response's hints into the shared state.
    pub fn observe(&self, hints: &RateLimitHints) {
        let pause = match hints.retry_after {
            Some(delay) => Some(delay),
            None if hints.near_limit || hints.remaining == Some(0) => Some(NEAR_LIMIT_PAUSE),
            None => None,
        };

        let mut state = self.lock();
        state.remaining = hints.remaining.or(state.remaining);
        if let Some(pause) = pause {
            let until = Instant::now() + pause;
            if state.paused_until.map_or(true, |current| until > current) {
                warn!(
                    pause_ms = pause.as_millis() as u64,
                    remaining = ?hints.remaining,
                    "remote rate limit reached, pausing dispatch"
                );
                state.paused_until = Some(until);
            }
        }
    }

    /// Whether dispatch is currently held back.
    pub fn is_paused(&self) -> bool {
        self.lock()
            .paused_until
            .is_some_and(|until| until > Instant::now())
    }

    /// Last reported remaining quota.
    pub fn remaining(&self) -> Option<u32> {
        self.lock().remaining
    }

    /// Sleep until any active pause has elapsed.
    pub async fn wait(&self) {
        loop {
            let until = match self.lock().paused_until {
                Some(until) if until > Instant::now() => until,
                _ => return,
            };
            debug!("waiting for rate-limit pause to elapse");
            tokio::time::sleep_until(until).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_pauses_dispatch() {
        let throttle = Throttle::new();
        assert!(!throttle.is_paused());

        throttle.observe(&RateLimitHints {
            remaining: Some(0),
            near_limit: true,
            retry_after: Some(Duration::from_secs(3)),
        });
        assert!(throttle.is_paused());
        assert_eq!(throttle.remaining(), Some(0));

        let start = Instant::now();
        throttle.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(!throttle.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_near_limit_without_delay_pauses_briefly() {
        let throttle = Throttle::new();
        throttle.observe(&RateLimitHints {
            remaining: Some(5),
            near_limit: true,
            retry_after: None,
        });
        assert!(throttle.is_paused());
        let start = Instant::now();
        throttle.wait().await;
        assert!(start.elapsed() >= NEAR_LIMIT_PAUSE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_hint_does_not_shorten_pause() {
        let throttle = Throttle::new();
        throttle.observe(&RateLimitHints {
            retry_after: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        throttle.observe(&RateLimitHints {
            retry_after: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        let start = Instant::now();
        throttle.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_plain_hints_do_not_pause() {
        let throttle = Throttle::new();
        throttle.observe(&RateLimitHints {
            remaining: Some(900),
            ..Default::default()
        });
        assert!(!throttle.is_paused());
        throttle.wait().await;
    }
}
