//! Due-schedule selection.
//!
//! Every schedule is evaluated once against the tick's reference instant.
//! Schedules whose expression cannot be evaluated are excluded and logged;
//! a fire time that lies before the reference instant aborts the whole
//! selection with [`SelectError::ClockRegression`].

use crate::error::{ExpressionError, SelectError};
use crate::schedule::Schedule;

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{trace, warn};

/// Computes when a schedule next fires. The runner asks it once per schedule
/// per tick.
pub trait FireTimeEvaluator: Send + Sync {
  fn next_fire(
    &self,
    schedule: &Schedule,
    reference: DateTime<Utc>,
  ) -> Result<DateTime<Utc>, ExpressionError>;
}

/// Evaluates the schedule's own cron expression, with `H` seeded by its name.
#[derive(Debug, Clone, Copy, Default)]
pub struct CronEvaluator;

impl FireTimeEvaluator for CronEvaluator {
  fn next_fire(
    &self,
    schedule: &Schedule,
    reference: DateTime<Utc>,
  ) -> Result<DateTime<Utc>, ExpressionError> {
    schedule.next_fire(reference)
  }
}

/// A schedule together with its next fire time and delay from the reference
/// instant. The delay is never negative.
#[derive(Debug, Clone)]
pub struct Candidate {
  schedule: Schedule,
  next_fire: DateTime<Utc>,
  delay: ChronoDuration,
}

impl Candidate {
  /// Fails with `ClockRegression` if `next_fire` precedes `now`.
  pub fn new(
    schedule: Schedule,
    next_fire: DateTime<Utc>,
    now: DateTime<Utc>,
  ) -> Result<Self, SelectError> {
    let delay = next_fire - now;
    if delay < ChronoDuration::zero() {
      return Err(SelectError::ClockRegression {
        schedule: schedule.name().to_string(),
        next_fire,
        reference: now,
      });
    }
    Ok(Self {
      schedule,
      next_fire,
      delay,
    })
  }

  pub fn schedule(&self) -> &Schedule {
    &self.schedule
  }

  pub fn into_schedule(self) -> Schedule {
    self.schedule
  }

  pub fn next_fire(&self) -> DateTime<Utc> {
    self.next_fire
  }

  pub fn delay(&self) -> ChronoDuration {
    self.delay
  }

  /// Whether the delay is strictly below `threshold`.
  pub fn is_due(&self, threshold: Duration) -> bool {
    match ChronoDuration::from_std(threshold) {
      Ok(threshold) => self.delay < threshold,
      // larger than any representable delay
      Err(_) => true,
    }
  }
}

/// A schedule left out of selection because its expression is unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Excluded {
  pub schedule: String,
  pub error: ExpressionError,
}

/// Result of evaluating a batch of schedules against one instant.
///
/// `candidates` keeps the caller's iteration order.
#[derive(Debug, Clone, Default)]
pub struct Selection {
  pub candidates: Vec<Candidate>,
  pub excluded: Vec<Excluded>,
}

impl Selection {
  pub fn evaluate<'a>(
    now: DateTime<Utc>,
    schedules: impl IntoIterator<Item = &'a Schedule>,
  ) -> Result<Self, SelectError> {
    Self::evaluate_with(&CronEvaluator, now, schedules)
  }

  /// Like [`evaluate`](Self::evaluate), with fire times from `evaluator`.
  pub fn evaluate_with<'a>(
    evaluator: &dyn FireTimeEvaluator,
    now: DateTime<Utc>,
    schedules: impl IntoIterator<Item = &'a Schedule>,
  ) -> Result<Self, SelectError> {
    let mut selection = Selection::default();
    for schedule in schedules {
      let next_fire = match evaluator.next_fire(schedule, now) {
        Ok(next_fire) => next_fire,
        Err(error) => {
          warn!(schedule = %schedule.name(), expression = %schedule.expression(), %error, "Excluding schedule with unusable expression.");
          selection.excluded.push(Excluded {
            schedule: schedule.name().to_string(),
            error,
          });
          continue;
        }
      };
      let candidate = Candidate::new(schedule.clone(), next_fire, now)?;
      trace!(schedule = %schedule.name(), %next_fire, delay_ms = candidate.delay.num_milliseconds(), "Evaluated schedule.");
      selection.candidates.push(candidate);
    }
    Ok(selection)
  }

  /// The candidate with the smallest delay. Equal delays resolve to the one
  /// encountered first.
  pub fn earliest(&self) -> Option<&Candidate> {
    let mut best: Option<&Candidate> = None;
    for candidate in &self.candidates {
      match best {
        Some(current) if candidate.delay >= current.delay => {}
        _ => best = Some(candidate),
      }
    }
    best
  }

  /// The earliest candidate, if it is due within `threshold`.
  pub fn due(&self, threshold: Duration) -> Option<&Candidate> {
    self.earliest().filter(|c| c.is_due(threshold))
  }

  /// Every candidate due within `threshold`, ordered by delay and then by
  /// position. The head of this list is [`due`](Self::due).
  pub fn all_due(&self, threshold: Duration) -> Vec<&Candidate> {
    let mut due: Vec<&Candidate> = self
      .candidates
      .iter()
      .filter(|c| c.is_due(threshold))
      .collect();
    due.sort_by_key(|c| c.delay);
    due
  }
}

/// Selects the schedule to act on at `now`, or `None` when nothing is due
/// within `threshold` (normally one tick period).
pub fn select_due(
  now: DateTime<Utc>,
  schedules: &[Schedule],
  threshold: Duration,
) -> Result<Option<Candidate>, SelectError> {
  let selection = Selection::evaluate(now, schedules)?;
  Ok(selection.due(threshold).cloned())
}
