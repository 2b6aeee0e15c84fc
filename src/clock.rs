//! Injectable time source.
//!
//! Handlers that pace their work and caches that expire entries take a
//! [`Clock`] instead of calling `tokio::time` directly, so tests can move
//! time forward without waiting for it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Time source used by handlers and caches
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;

    /// Suspend for `duration` as measured by this clock
    async fn sleep(&self, duration: Duration);
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock backed by `tokio::time` (honours `tokio::time::pause`)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Default shared clock
#[must_use]
pub fn system() -> SharedClock {
    Arc::new(SystemClock)
}

/// Clock that only moves when told to.
///
/// `sleep` parks until [`ManualClock::advance`] has moved the clock past the
/// wake-up point.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
    ticked: Notify,
}

impl ManualClock {
    /// Start at the current tokio instant
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
            ticked: Notify::new(),
        }
    }

    /// Move time forward and wake sleepers whose deadline passed
    pub fn advance(&self, by: Duration) {
        {
            let mut now = self.now.lock();
            *now += by;
        }
        self.ticked.notify_waiters();
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now() + duration;
        loop {
            let ticked = self.ticked.notified();
            if self.now() >= deadline {
                return;
            }
            ticked.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_clock_sleep_waits_for_advance() {
        let clock = Arc::new(ManualClock::new());
        let start = clock.now();

        let sleeper = {
            let clock = Arc::clone(&clock);
            tokio::spawn(async move { clock.sleep(Duration::from_secs(5)).await })
        };

        tokio::task::yield_now().await;
        clock.advance(Duration::from_secs(3));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(2));
        sleeper.await.unwrap();
        assert_eq!(clock.now() - start, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn zero_sleep_returns_immediately() {
        let clock = ManualClock::new();
        clock.sleep(Duration::ZERO).await;
    }

    #[tokio::test(start_paused = true)]
    async fn system_clock_follows_paused_tokio_time() {
        let clock = SystemClock;
        let start = clock.now();
        clock.sleep(Duration::from_secs(60)).await;
        assert!(clock.now() - start >= Duration::from_secs(60));
    }
}
