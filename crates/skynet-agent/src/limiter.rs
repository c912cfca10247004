//! Provider rate limiter (C2, §4.2): strict sliding-window admission plus a
//! reactive global block triggered on 429, plus `execute_with_retry`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use skynet_core::SlidingWindowLimiter;
use tracing::{debug, warn};

use crate::error::ProviderError;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Wraps [`SlidingWindowLimiter`] (C1) with a reactive global block and
/// backoff-with-retry, one instance per process (§4.2 "Singleton scope").
pub struct ProviderLimiter {
    window: SlidingWindowLimiter,
    blocked_until_ms: AtomicU64,
}

impl ProviderLimiter {
    pub fn new(n: u32, window_secs: f64) -> skynet_core::Result<Self> {
        Ok(Self {
            window: SlidingWindowLimiter::new(n, window_secs)?,
            blocked_until_ms: AtomicU64::new(0),
        })
    }

    /// Set a reactive block for `seconds` from now (called on upstream 429).
    pub fn set_blocked(&self, seconds: f64) {
        let until = now_millis() + (seconds * 1000.0) as u64;
        self.blocked_until_ms.fetch_max(until, Ordering::SeqCst);
        warn!(seconds, "provider limiter: reactive block set");
    }

    /// Wait out any reactive block, then acquire a sliding-window slot.
    /// Returns whether the caller waited on the reactive block.
    pub async fn acquire(&self) -> bool {
        let waited = self.wait_if_blocked().await;
        self.window.acquire().await;
        waited
    }

    /// Suspend until `blocked_until` has passed, without touching the window.
    pub async fn wait_if_blocked(&self) -> bool {
        let until = self.blocked_until_ms.load(Ordering::SeqCst);
        let now = now_millis();
        if until > now {
            let wait = Duration::from_millis(until - now);
            debug!(?wait, "provider limiter: waiting out reactive block");
            tokio::time::sleep(wait).await;
            true
        } else {
            false
        }
    }

    /// Run `f` through the limiter, retrying on retryable provider errors with
    /// exponential backoff + jitter (§4.2). The first rate-limit failure counts
    /// as attempt 0; failure after `max_retries` additional attempts re-raises.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        mut f: F,
        max_retries: u32,
        base_delay_secs: f64,
        max_delay_secs: f64,
        jitter_secs: f64,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.acquire().await;
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    let delay = (base_delay_secs * 2f64.powi(attempt as i32)).min(max_delay_secs);
                    let jitter = if jitter_secs > 0.0 {
                        rand::thread_rng().gen_range(0.0..jitter_secs)
                    } else {
                        0.0
                    };
                    let total = delay + jitter;
                    self.set_blocked(total);
                    warn!(attempt, total, "provider call failed, retrying with backoff");
                    tokio::time::sleep(Duration::from_secs_f64(total)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn reactive_block_delays_concurrent_waiters() {
        let limiter = Arc::new(ProviderLimiter::new(100, 60.0).unwrap());
        limiter.set_blocked(1.0);

        let a = limiter.clone();
        let b = limiter.clone();
        let (ra, rb) = tokio::join!(a.wait_if_blocked(), b.wait_if_blocked());
        assert!(ra);
        assert!(rb);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_with_retry_succeeds_after_rate_limit() {
        let limiter = ProviderLimiter::new(100, 60.0).unwrap();
        let calls = AtomicU32::new(0);

        let result = limiter
            .execute_with_retry(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(ProviderError::RateLimited { retry_after_ms: 0 })
                        } else {
                            Ok(42)
                        }
                    }
                },
                1,
                1.0,
                10.0,
                0.0,
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_with_retry_gives_up_after_max_retries() {
        let limiter = ProviderLimiter::new(100, 60.0).unwrap();
        let result: Result<(), ProviderError> = limiter
            .execute_with_retry(
                || async { Err(ProviderError::RateLimited { retry_after_ms: 0 }) },
                1,
                0.01,
                1.0,
                0.0,
            )
            .await;
        assert!(result.is_err());
    }
}
