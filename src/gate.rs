use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Source of local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Half-open hour range `[start_hour, end_hour)` in local time.
///
/// A window whose start is later than its end wraps past midnight,
/// e.g. `22..2` is open from 22:00 until 01:59.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl SendWindow {
    pub fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour,
            end_hour,
        }
    }

    pub fn is_open_at(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            self.start_hour <= hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }

    pub fn is_open(&self, clock: &dyn Clock) -> bool {
        self.is_open_at(clock.now().hour())
    }
}

impl std::fmt::Display for SendWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:00-{}:00", self.start_hour, self.end_hour)
    }
}

/// Block until the window opens, re-checking every `poll_interval`.
pub async fn wait_until_open(window: &SendWindow, clock: &dyn Clock, poll_interval: Duration) {
    loop {
        let now = clock.now();
        if window.is_open_at(now.hour()) {
            return;
        }
        log::info!(
            "⏳ Waiting for sending window ({window})... now {}",
            now.format("%H:%M:%S")
        );
        tokio::time::sleep(poll_interval).await;
    }
}

/// Linear warm-up of the per-run send cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupSchedule {
    pub base_limit: usize,
    pub per_day_increment: usize,
    pub absolute_ceiling: usize,
}

impl Default for WarmupSchedule {
    fn default() -> Self {
        Self {
            base_limit: 20,
            per_day_increment: 30,
            absolute_ceiling: 200,
        }
    }
}

impl WarmupSchedule {
    /// `min(ceiling, base + days * increment)`
    pub fn daily_limit(&self, days_elapsed: usize) -> usize {
        self.per_day_increment
            .saturating_mul(days_elapsed)
            .saturating_add(self.base_limit)
            .min(self.absolute_ceiling)
    }
}
