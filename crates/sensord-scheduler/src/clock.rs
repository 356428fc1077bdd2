use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

/// Integer scheduling time unit. [`SystemClock`] ticks once per second.
pub type Tick = i64;

/// Source of the current tick plus a sleep primitive.
///
/// The scheduler never reads wall-clock time for scheduling decisions; it
/// asks its clock, so tests can drive it with a [`ManualClock`].
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Tick;

    /// Sleep for `duration`. A zero duration is a cooperative yield.
    async fn delay(&self, duration: Duration);
}

/// Earliest tick a newly created or rescheduled entry may fire at.
pub fn next_schedulable_tick(clock: &dyn Clock) -> Tick {
    clock.now() + 1
}

/// Unix seconds from the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Tick {
        chrono::Utc::now().timestamp()
    }

    async fn delay(&self, duration: Duration) {
        if duration.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Manually advanced clock. `delay` never sleeps, it only yields.
#[derive(Debug, Default)]
pub struct ManualClock {
    tick: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Tick) -> Self {
        Self {
            tick: AtomicI64::new(start),
        }
    }

    /// Move the clock forward by `ticks` and return the new time.
    pub fn advance(&self, ticks: Tick) -> Tick {
        self.tick.fetch_add(ticks, Ordering::SeqCst) + ticks
    }

    pub fn set(&self, tick: Tick) {
        self.tick.store(tick, Ordering::SeqCst);
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Tick {
        self.tick.load(Ordering::SeqCst)
    }

    async fn delay(&self, _duration: Duration) {
        tokio::task::yield_now().await;
    }
}
