//! Sliding-window request limiter for embedding calls.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Allows at most `max_requests` acquisitions per `window`.
///
/// Waiters queue on the internal mutex, so they are admitted in arrival
/// order.
#[derive(Debug)]
pub struct RateLimiter {
    requests: Mutex<VecDeque<Instant>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            requests: Mutex::new(VecDeque::new()),
            max_requests: max_requests.max(1) as usize,
            window,
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    /// Wait until a request slot is free, then claim it.
    pub async fn acquire(&self) {
        let mut requests = self.requests.lock().await;

        let now = Instant::now();
        while requests
            .front()
            .is_some_and(|&t| now.duration_since(t) >= self.window)
        {
            requests.pop_front();
        }

        if requests.len() >= self.max_requests {
            if let Some(&oldest) = requests.front() {
                let wait_time = self.window.saturating_sub(now.duration_since(oldest));
                if !wait_time.is_zero() {
                    tracing::debug!(?wait_time, "embedding rate limit reached, waiting");
                    tokio::time::sleep(wait_time).await;
                }
                requests.pop_front();
            }
        }

        requests.push_back(Instant::now());
    }
}
