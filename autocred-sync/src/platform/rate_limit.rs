//! Outbound request rate limiter
//!
//! Single shared FIFO gate enforcing a minimum spacing between dispatched
//! platform calls, shared by every endpoint (the platform's ceiling is
//! aggregate, not per-endpoint). Callers queue on the internal mutex; tokio's
//! mutex wakes them in acquisition order.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Minimum-interval dispatch gate
pub struct RateLimiter {
    last_dispatch: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_dispatch: Mutex::new(None),
            min_interval,
        }
    }

    /// Wait until the minimum interval since the previous dispatch has
    /// elapsed, then claim the next slot.
    pub async fn acquire(&self) {
        let mut last = self.last_dispatch.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                tracing::trace!("Rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::new(Duration::from_millis(10));
        assert_eq!(limiter.min_interval, Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatches_spaced_by_min_interval() {
        let limiter = RateLimiter::new(Duration::from_millis(10));

        let mut timestamps = Vec::new();
        for _ in 0..5 {
            limiter.acquire().await;
            timestamps.push(Instant::now());
        }

        for pair in timestamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_acquire_is_immediate() {
        let limiter = RateLimiter::new(Duration::from_secs(5));

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(1));
    }
}
