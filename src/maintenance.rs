//! The system-wide maintenance ("quiet mode") flag and the guard that holds
//! it around a schedule's mutations.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

/// A process-wide flag that suppresses new work intake while set.
pub trait MaintenanceFlag: Send + Sync {
  fn is_set(&self) -> bool;
  fn set(&self);
  fn clear(&self);
}

/// An in-memory maintenance flag.
#[derive(Debug, Default)]
pub struct QuietMode {
  set: AtomicBool,
}

impl QuietMode {
  pub fn new(initially_set: bool) -> Self {
    Self {
      set: AtomicBool::new(initially_set),
    }
  }
}

impl MaintenanceFlag for QuietMode {
  fn is_set(&self) -> bool {
    self.set.load(Ordering::SeqCst)
  }

  fn set(&self) {
    self.set.store(true, Ordering::SeqCst);
  }

  fn clear(&self) {
    self.set.store(false, Ordering::SeqCst);
  }
}

/// Holds the maintenance flag for the lifetime of the guard.
///
/// On entry the flag's current value is recorded and the flag is set if it
/// was clear. On drop the flag is cleared only if it was clear on entry.
/// Dropping covers every exit path: normal return, `?`, a panic unwinding
/// through the owner, and cancellation of the future that owns the guard.
pub struct MaintenanceWindow {
  flag: Arc<dyn MaintenanceFlag>,
  was_set: bool,
  schedule: String,
}

impl MaintenanceWindow {
  pub fn enter(flag: Arc<dyn MaintenanceFlag>, schedule: &str) -> Self {
    let was_set = flag.is_set();
    if was_set {
      trace!(schedule, "Maintenance flag already set; leaving it to its owner.");
    } else {
      flag.set();
      debug!(schedule, "Maintenance flag set.");
    }
    Self {
      flag,
      was_set,
      schedule: schedule.to_string(),
    }
  }

  /// The flag's value when the window was entered.
  pub fn was_set(&self) -> bool {
    self.was_set
  }
}

impl fmt::Debug for MaintenanceWindow {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MaintenanceWindow")
      .field("schedule", &self.schedule)
      .field("was_set", &self.was_set)
      .finish()
  }
}

impl Drop for MaintenanceWindow {
  fn drop(&mut self) {
    if !self.was_set {
      self.flag.clear();
      debug!(schedule = %self.schedule, "Maintenance flag restored (cleared).");
    }
  }
}
