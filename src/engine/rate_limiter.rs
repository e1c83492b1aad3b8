//! Rate limiter shared by all outbound registry requests

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};

/// Spaces permits evenly so that at most `rate` are handed out in any one-second window
///
/// Each caller reserves the next free slot under a short lock and then sleeps
/// until that slot outside the lock, so concurrent callers queue up in order
/// without holding the lock while waiting.
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter allowing `requests_per_second` permits per second (minimum 1)
    pub fn new(requests_per_second: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / requests_per_second.max(1),
            next_slot: Mutex::new(None),
        }
    }

    /// Minimum spacing between two permits
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits until the caller may issue one request
    pub async fn acquire(&self) {
        let slot = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next_slot {
                Some(next) if next > now => next,
                _ => now,
            };
            *next_slot = Some(slot + self.interval);
            slot
        };

        sleep_until(slot).await;
    }
}
