//! Minimum spacing between outbound calls to one source

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Grants at most `max_per_second` calls per second, without burst credit
///
/// Waiters queue on one async mutex, so grants go out in arrival order and
/// each is spaced at least `1 / max_per_second` after the previous one.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Option<Duration>,
    last_grant: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter; a non-positive or non-finite rate disables spacing
    pub fn new(max_per_second: f64) -> Self {
        let interval = if max_per_second.is_finite() && max_per_second > 0.0 {
            Some(Duration::from_secs_f64(1.0 / max_per_second))
        } else {
            None
        };

        Self {
            interval,
            last_grant: Mutex::new(None),
        }
    }

    /// Minimum spacing between grants, if any
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Suspends until the next call is allowed
    pub async fn acquire(&self) {
        let Some(interval) = self.interval else {
            return;
        };

        let mut last = self.last_grant.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}
