//! Fixed-window call limiter.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Window {
    started: Instant,
    used: u32,
}

/// Allows at most `limit` calls per `window`; callers over budget sleep until
/// the window rolls over.
#[derive(Debug)]
pub struct WindowRateLimiter {
    limit: u32,
    window: Duration,
    state: Mutex<Window>,
}

impl WindowRateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Reserve `calls` slots, sleeping first if the current window is full.
    /// Returns how long the caller waited.
    pub async fn acquire(&self, calls: u32) -> Duration {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if now.duration_since(state.started) >= self.window {
            state.started = now;
            state.used = 0;
        }

        let mut waited = Duration::ZERO;
        if state.used > 0 && state.used.saturating_add(calls) > self.limit {
            let wait = self
                .window
                .saturating_sub(now.duration_since(state.started));
            tracing::info!(
                limit = self.limit,
                wait_secs = wait.as_secs_f64(),
                "Rate limit reached, waiting for the window to reset"
            );
            tokio::time::sleep(wait).await;
            state.started = Instant::now();
            state.used = 0;
            waited = wait;
        }

        state.used = state.used.saturating_add(calls);
        waited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_waits_when_window_full() {
        let limiter = WindowRateLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();

        for _ in 0..3 {
            assert_eq!(limiter.acquire(1).await, Duration::ZERO);
        }
        let waited = limiter.acquire(1).await;

        assert_eq!(waited, Duration::from_secs(60));
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rolls_over() {
        let limiter = WindowRateLimiter::new(2, Duration::from_secs(10));
        limiter.acquire(2).await;

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(limiter.acquire(2).await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_not_blocked_forever() {
        let limiter = WindowRateLimiter::new(2, Duration::from_secs(10));
        assert_eq!(limiter.acquire(5).await, Duration::ZERO);
    }
}
