//! Injectable wall clock.
//!
//! Token expiry, lock windows and lease windows are all evaluated against a
//! [`Clock`] rather than the system time directly so tests can move time
//! forward deterministically.

use crate::message::Timestamp;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;

/// Source of the current wall-clock time
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time
    fn now(&self) -> Timestamp;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually driven clock; clones share the same instant
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Timestamp>>,
}

impl ManualClock {
    /// Create a clock frozen at the given instant
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a clock frozen at the given epoch second
    ///
    /// Out-of-range values fall back to the Unix epoch.
    pub fn at_epoch_seconds(seconds: i64) -> Self {
        let start = Timestamp::from_epoch_seconds(seconds)
            .or_else(|| Timestamp::from_epoch_seconds(0))
            .unwrap_or_else(Timestamp::now);
        Self::new(start)
    }

    /// Move the clock forward
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = now.saturating_add(duration);
    }

    /// Jump to an absolute instant
    pub fn set(&self, instant: Timestamp) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}
