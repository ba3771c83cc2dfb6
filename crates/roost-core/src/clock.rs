//! Injectable time source.
//!
//! Every component that reasons about windows, backoff or cool-downs reads
//! time through a [`Clock`] so tests can move time forward deterministically.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        self.now
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.lock();
        *now += by;
    }

    /// Convenience for tests written against `std::time::Duration`.
    pub fn advance_std(&self, by: std::time::Duration) {
        self.advance(to_chrono(by));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

/// Longest span we ever add to a timestamp.
const MAX_SPAN_DAYS: i64 = 36_500;

/// Convert a `std` duration into a chrono one, saturating at a century so
/// that `now + span` can never overflow.
pub fn to_chrono(d: std::time::Duration) -> Duration {
    Duration::from_std(d)
        .unwrap_or_else(|_| Duration::days(MAX_SPAN_DAYS))
        .min(Duration::days(MAX_SPAN_DAYS))
}

/// Positive span from `from` to `to`, zero when `to` is not after `from`.
pub fn until(from: DateTime<Utc>, to: DateTime<Utc>) -> std::time::Duration {
    (to - from).to_std().unwrap_or(std::time::Duration::ZERO)
}
