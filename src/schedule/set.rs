use super::{Schedule, ValidationIssue};

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

/// The active, ordered schedule collection shared between the scheduler
/// handle and its tick runner.
///
/// Order is configuration order and is what the selector uses to break ties.
/// Each tick works on a [`snapshot`](Self::snapshot), so edits made while a
/// tick is running take effect from the next tick.
#[derive(Debug, Clone, Default)]
pub struct ScheduleSet {
  inner: Arc<RwLock<Vec<Schedule>>>,
}

impl ScheduleSet {
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a set from `schedules`, keeping only the first schedule of any
  /// given name. No validation is performed.
  pub fn from_schedules(schedules: impl IntoIterator<Item = Schedule>) -> Self {
    let set = Self::new();
    {
      let mut inner = set.inner.write();
      for schedule in schedules {
        if !inner.contains(&schedule) {
          inner.push(schedule);
        }
      }
    }
    set
  }

  /// A copy of the current schedules in configuration order.
  pub fn snapshot(&self) -> Vec<Schedule> {
    self.inner.read().clone()
  }

  /// Inserts `schedule`, replacing an existing schedule of the same name in
  /// place. Returns the replaced schedule, if any.
  pub fn upsert(&self, schedule: Schedule) -> Option<Schedule> {
    let mut inner = self.inner.write();
    match inner.iter_mut().find(|s| **s == schedule) {
      Some(existing) => {
        debug!(schedule = %schedule.name(), "Replacing schedule in place.");
        Some(std::mem::replace(existing, schedule))
      }
      None => {
        debug!(schedule = %schedule.name(), "Appending schedule.");
        inner.push(schedule);
        None
      }
    }
  }

  /// Removes the schedule named `name`.
  pub fn remove(&self, name: &str) -> Option<Schedule> {
    let mut inner = self.inner.write();
    let index = inner.iter().position(|s| s.name() == name)?;
    Some(inner.remove(index))
  }

  /// Replaces the whole collection with the valid schedules from
  /// `schedules`, returning the ones that were rejected together with their
  /// problems. Later duplicates of a name are rejected as well.
  pub fn replace_all(
    &self,
    schedules: impl IntoIterator<Item = Schedule>,
  ) -> Vec<(Schedule, Vec<ValidationIssue>)> {
    let mut accepted: Vec<Schedule> = Vec::new();
    let mut rejected = Vec::new();
    for schedule in schedules {
      if let Err(issues) = schedule.validate() {
        warn!(schedule = %schedule, ?issues, "Rejecting invalid schedule.");
        rejected.push((schedule, issues));
        continue;
      }
      if accepted.contains(&schedule) {
        warn!(schedule = %schedule.name(), "Rejecting schedule with duplicate name.");
        let issue = ValidationIssue::DuplicateName(schedule.name().to_string());
        rejected.push((schedule, vec![issue]));
        continue;
      }
      accepted.push(schedule);
    }
    *self.inner.write() = accepted;
    rejected
  }

  pub fn get(&self, name: &str) -> Option<Schedule> {
    self.inner.read().iter().find(|s| s.name() == name).cloned()
  }

  pub fn names(&self) -> Vec<String> {
    self
      .inner
      .read()
      .iter()
      .map(|s| s.name().to_string())
      .collect()
  }

  pub fn len(&self) -> usize {
    self.inner.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.read().is_empty()
  }
}
