//! Per-user throttle applied while slow mode is on

use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Remembers each user's last accepted message for one interval
#[derive(Clone)]
pub struct SlowModeLimiter {
    recent: Cache<i64, ()>,
    interval: Duration,
    throttled: Arc<AtomicU64>,
}

impl SlowModeLimiter {
    /// Create a limiter allowing one message per user every `interval`
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        let recent = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(interval)
            .build();
        Self {
            recent,
            interval,
            throttled: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns `true` and starts a new interval if the user may send now
    pub async fn allow(&self, user_id: i64) -> bool {
        if self.recent.entry(user_id).or_insert(()).await.is_fresh() {
            return true;
        }

        let count = self.throttled.fetch_add(1, Ordering::Relaxed) + 1;
        if count.is_multiple_of(100) {
            debug!(
                "Throttled {} messages in slow mode (recent: user {})",
                count, user_id
            );
        }
        false
    }

    /// Total throttled messages
    #[must_use]
    pub fn throttled_count(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }

    /// Configured interval
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }
}
