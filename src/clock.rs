//! Injectable clock so the admission pipeline's timestamp and sleep logic can be
//! driven deterministically in tests, per the "every timestamped operation
//! consults an abstracted monotonic clock" design note.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A source of wall-clock time and an async sleep primitive.
///
/// `RateLimitTracker` and `PriorityQueueManager` hold a `Clock` instead of
/// calling `chrono::Utc::now()` / `tokio::time::sleep` directly, so tests can
/// advance time without actually waiting.
#[async_trait]
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the calling task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by `chrono::Utc::now()` and `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Deterministic clock for tests: `now()` starts at the Unix epoch and only
/// advances when `advance()` is called; `sleep()` advances itself by the
/// requested duration and returns immediately.
#[derive(Debug, Clone)]
pub struct MockClock {
    millis_since_epoch: Arc<AtomicI64>,
}

impl MockClock {
    /// Create a mock clock starting at the given instant.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis_since_epoch: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    /// Move the clock forward by `duration` without sleeping.
    pub fn advance(&self, duration: Duration) {
        self.millis_since_epoch
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(DateTime::from_timestamp(0, 0).expect("epoch is a valid timestamp"))
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis_since_epoch.load(Ordering::SeqCst))
            .expect("stored millis are always a valid timestamp")
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_clock_advances_on_sleep() {
        let clock = MockClock::default();
        let before = clock.now();
        clock.sleep(Duration::from_secs(5)).await;
        let after = clock.now();
        assert_eq!((after - before).num_seconds(), 5);
    }

    #[test]
    fn mock_clock_advances_explicitly() {
        let clock = MockClock::default();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now().timestamp_millis(), 1500);
    }
}
