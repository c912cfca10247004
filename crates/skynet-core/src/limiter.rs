use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::{BrokerError, Result};

/// Sliding-window rate limiter: at most `n` acquires are granted within any
/// trailing `window` of wall-clock time.
///
/// Ported from the Python `SlidingWindowLimiter` (§4.1): a lock-protected
/// deque of grant timestamps, pruned of anything older than `window` on each
/// `acquire()`. There is no release call — a grant is permanent once made.
pub struct SlidingWindowLimiter {
    n: usize,
    window: Duration,
    grants: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(n: u32, window_secs: f64) -> Result<Self> {
        if n == 0 {
            return Err(BrokerError::Config(
                "rate limit n must be greater than zero".into(),
            ));
        }
        if !(window_secs > 0.0) {
            return Err(BrokerError::Config(
                "rate limit window must be greater than zero".into(),
            ));
        }
        Ok(Self {
            n: n as usize,
            window: Duration::from_secs_f64(window_secs),
            grants: Mutex::new(VecDeque::with_capacity(n as usize)),
        })
    }

    /// Suspend until a grant slot is available, then record it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut grants = self.grants.lock().await;
                let now = Instant::now();
                while let Some(&oldest) = grants.front() {
                    if now.duration_since(oldest) >= self.window {
                        grants.pop_front();
                    } else {
                        break;
                    }
                }
                if grants.len() < self.n {
                    grants.push_back(now);
                    None
                } else {
                    let oldest = *grants.front().expect("len >= n > 0");
                    Some(self.window - now.duration_since(oldest))
                }
            };

            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_bounds() {
        assert!(SlidingWindowLimiter::new(0, 1.0).is_err());
        assert!(SlidingWindowLimiter::new(1, 0.0).is_err());
        assert!(SlidingWindowLimiter::new(1, -1.0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn grants_up_to_n_immediately_then_waits() {
        let limiter = SlidingWindowLimiter::new(2, 1.0).unwrap();

        limiter.acquire().await;
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(Instant::now().duration_since(start) >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn old_grants_expire_out_of_the_window() {
        let limiter = SlidingWindowLimiter::new(1, 1.0).unwrap();

        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(2)).await;

        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(Instant::now().duration_since(start), Duration::ZERO);
    }
}
