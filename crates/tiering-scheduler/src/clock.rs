//! Injected time source.
//! Every window check, timestamp and cooldown goes through a [`Clock`] so the
//! engine can be driven by a synthetic clock in tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};

/// Wall-clock source for the engine.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current local wall-clock time.
    fn now(&self) -> NaiveDateTime;

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Real local time, tokio timers for sleeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Synthetic clock: time only moves when told to. `sleep` advances the
/// clock by the requested duration and returns immediately.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, at: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}
