use crate::runner::ScheduleReport;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur while building a scheduler with `SchedulerBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("Tick period must be greater than zero")]
  ZeroTickPeriod,
  #[error("A target resolver must be provided (`resolver`)")]
  MissingResolver,
  #[error("A maintenance flag must be provided (`maintenance_flag`)")]
  MissingMaintenanceFlag,
  #[error("The periodic tick loop must be started from within a Tokio runtime")]
  NoRuntime,
}

/// A schedule expression that cannot be evaluated.
///
/// Every variant makes the owning schedule ineligible for selection; none of
/// them is fatal to a tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpressionError {
  #[error("Schedule expression is empty")]
  Empty,
  #[error("Expected 5 fields (minute hour day-of-month month day-of-week), found {found}")]
  FieldCount { found: usize },
  #[error("Invalid {field} token `{token}`: {reason}")]
  InvalidField {
    field: &'static str,
    token: String,
    reason: &'static str,
  },
  #[error("{field} value {value} is outside {min}-{max}")]
  OutOfRange {
    field: &'static str,
    value: u32,
    min: u32,
    max: u32,
  },
  #[error("Unknown alias `{0}`")]
  UnknownAlias(String),
  /// The resolved fields could not be turned into a timetable.
  #[error("Expression `{expression}` was rejected: {reason}")]
  Rejected { expression: String, reason: String },
  #[error("Expression `{expression}` has no upcoming fire time")]
  NoFireTime { expression: String },
}

/// Errors raised by the due-schedule selector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
  /// The evaluator produced a fire time before the reference instant.
  /// This aborts the whole tick before any mutation is made.
  #[error(
    "Next fire time {next_fire} of schedule `{schedule}` precedes the reference instant {reference}"
  )]
  ClockRegression {
    schedule: String,
    next_fire: DateTime<Utc>,
    reference: DateTime<Utc>,
  },
}

/// Failure reported by a target's persistence step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PersistError(pub String);

impl PersistError {
  pub fn new(message: impl Into<String>) -> Self {
    Self(message.into())
  }
}

/// Errors raised while applying a schedule to one of its targets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
  #[error("Target `{name}` could not be resolved")]
  UnresolvableTarget { name: String },
  #[error("Target `{name}` is a {kind} and cannot be mutated")]
  UnsupportedTargetKind { name: String, kind: String },
  #[error("Failed to persist target `{target}`: {source}")]
  PersistenceFailed {
    target: String,
    #[source]
    source: PersistError,
  },
  #[error("Mutation of schedule `{schedule}` failed on target `{target}`: {reason}")]
  MutationFailed {
    schedule: String,
    target: String,
    reason: String,
  },
}

impl MutationError {
  /// Whether this error stops the schedule from visiting its remaining targets.
  ///
  /// Only the catch-all `MutationFailed` does; every other variant is scoped
  /// to the single target it names.
  pub fn aborts_schedule(&self) -> bool {
    matches!(self, MutationError::MutationFailed { .. })
  }

  /// Name of the target the error refers to.
  pub fn target(&self) -> &str {
    match self {
      MutationError::UnresolvableTarget { name } => name,
      MutationError::UnsupportedTargetKind { name, .. } => name,
      MutationError::PersistenceFailed { target, .. } => target,
      MutationError::MutationFailed { target, .. } => target,
    }
  }
}

/// Error surfaced by the administrative "run this schedule now" path.
///
/// The pipeline always runs to its normal end (the maintenance flag is
/// restored) before this error is returned; the partial report is attached.
#[derive(Error, Debug, Clone)]
#[error("Schedule `{schedule}` did not apply cleanly: {source}")]
pub struct RunNowError {
  pub schedule: String,
  #[source]
  pub source: MutationError,
  pub report: ScheduleReport,
}

// --- Shutdown Errors ---

/// Errors related to stopping the periodic tick loop (`LabelScheduler::shutdown`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (tick loop already stopped).")]
  SignalFailed,
  #[error("Timed out waiting for the tick loop and in-flight ticks to finish.")]
  Timeout,
  #[error("The tick loop or an in-flight tick panicked during shutdown.")]
  TaskPanic,
  #[error("Shutdown already in progress or completed.")]
  AlreadyShutDown,
}
