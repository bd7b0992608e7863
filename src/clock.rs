//! Clock abstraction for the tick runner.
//!
//! The runner reads the current instant once per tick. No timezone conversion
//! is performed anywhere: schedule fields are matched against the instant in
//! UTC, and fire times are returned in the same clock.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

/// Supplies the current instant for each tick.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to. Used by tests and by hosts that
/// drive ticks from their own notion of time.
#[derive(Debug)]
pub struct ManualClock {
  current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      current: Mutex::new(start),
    }
  }

  /// Moves the clock forward (or backward, for negative deltas).
  pub fn advance(&self, delta: ChronoDuration) {
    let mut current = self.current.lock();
    *current += delta;
  }

  pub fn set(&self, instant: DateTime<Utc>) {
    *self.current.lock() = instant;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.current.lock()
  }
}
