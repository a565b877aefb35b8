//! Wall-clock abstraction used for cooldown arithmetic.
//!
//! Cooldowns are expressed as seconds since the Unix epoch with float
//! precision, matching what the store persists as `last_fired_at`.

use std::sync::Mutex;

use chrono::Utc;

/// Source of "now" in seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// Current time in seconds since the Unix epoch.
    fn now_secs(&self) -> f64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> f64 {
        let now = Utc::now();
        #[allow(clippy::cast_precision_loss)]
        let secs = now.timestamp() as f64;
        secs + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
    }
}

/// A manually advanced clock for deterministic tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    /// Create a clock frozen at `start` seconds.
    #[must_use]
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: f64) {
        if let Ok(mut now) = self.now.lock() {
            *now += secs;
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, secs: f64) {
        if let Ok(mut now) = self.now.lock() {
            *now = secs;
        }
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> f64 {
        self.now.lock().map(|n| *n).unwrap_or(0.0)
    }
}
