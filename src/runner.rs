//! The tick runner: one pass of selection and mutation.
//!
//! A tick evaluates every configured schedule, picks the due one and runs
//! the mutation pipeline for it inside a [`MaintenanceWindow`]. Per-target
//! results are returned as values; nothing a tick does is surfaced as an
//! error except a clock regression, which aborts the tick before any
//! mutation.

#[cfg(feature = "tick_context")]
use crate::context::{TickContext, CURRENT_TICK_CONTEXT};
use crate::clock::Clock;
use crate::error::{MutationError, PersistError, RunNowError, SelectError};
use crate::labels;
use crate::maintenance::{MaintenanceFlag, MaintenanceWindow};
use crate::metrics::EngineMetrics;
use crate::pool::{self, ResizeOutcome};
use crate::schedule::{LabelAction, Schedule, ScheduleSet};
use crate::selector::{Excluded, FireTimeEvaluator, Selection};
use crate::target::{Target, TargetKind, TargetResolver};

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// How a schedule pipeline was started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Trigger {
  /// The periodic tick (or `trigger_tick`).
  Periodic,
  /// The administrative run-now path.
  Manual,
}

/// What a mutation did to one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetChange {
  pub target: String,
  pub kind: TargetKind,
  pub labels_before: String,
  pub labels_after: String,
  /// Present when the schedule requested a capacity for this target and the
  /// target has a worker pool.
  pub resize: Option<ResizeOutcome>,
}

/// Result of visiting one target of a schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
  Applied(TargetChange),
  /// Not mutated: unresolvable or unsupported.
  Skipped {
    target: String,
    reason: MutationError,
  },
  /// Mutated in memory, but the save failed. Not rolled back.
  Unsaved {
    change: TargetChange,
    reason: MutationError,
  },
  /// The mutation failed outright; the schedule's remaining targets were not
  /// visited.
  Failed {
    target: String,
    reason: MutationError,
  },
}

impl TargetOutcome {
  pub fn target(&self) -> &str {
    match self {
      TargetOutcome::Applied(change) | TargetOutcome::Unsaved { change, .. } => &change.target,
      TargetOutcome::Skipped { target, .. } | TargetOutcome::Failed { target, .. } => target,
    }
  }

  pub fn error(&self) -> Option<&MutationError> {
    match self {
      TargetOutcome::Applied(_) => None,
      TargetOutcome::Skipped { reason, .. }
      | TargetOutcome::Unsaved { reason, .. }
      | TargetOutcome::Failed { reason, .. } => Some(reason),
    }
  }

  pub fn change(&self) -> Option<&TargetChange> {
    match self {
      TargetOutcome::Applied(change) | TargetOutcome::Unsaved { change, .. } => Some(change),
      _ => None,
    }
  }
}

/// Result of running one schedule's pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleReport {
  pub schedule: String,
  pub trigger: Trigger,
  /// The maintenance flag's value when the pipeline started.
  pub maintenance_was_set: bool,
  /// One entry per visited target, in the schedule's target order.
  pub outcomes: Vec<TargetOutcome>,
  /// Targets left unvisited after a failed mutation.
  pub unvisited: Vec<String>,
}

impl ScheduleReport {
  fn new(schedule: &str, trigger: Trigger, maintenance_was_set: bool) -> Self {
    Self {
      schedule: schedule.to_string(),
      trigger,
      maintenance_was_set,
      outcomes: Vec::new(),
      unvisited: Vec::new(),
    }
  }

  pub fn aborted(&self) -> bool {
    self
      .outcomes
      .iter()
      .any(|o| matches!(o, TargetOutcome::Failed { .. }))
  }

  pub fn first_error(&self) -> Option<&MutationError> {
    self.outcomes.iter().find_map(TargetOutcome::error)
  }

  /// Targets whose labels were changed, saved or not.
  pub fn mutated_targets(&self) -> Vec<&str> {
    self
      .outcomes
      .iter()
      .filter_map(|o| o.change().map(|c| c.target.as_str()))
      .collect()
  }
}

/// Result of one completed tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
  pub tick_id: Uuid,
  /// The clock reading every schedule was evaluated against.
  pub started_at: DateTime<Utc>,
  pub duration: Duration,
  /// Schedules that ran, in the order they ran.
  pub schedules: Vec<ScheduleReport>,
  pub excluded: Vec<Excluded>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
  /// The previous tick was still running; nothing was done.
  Skipped,
  Completed(TickReport),
  /// Selection failed; nothing was mutated.
  Aborted { tick_id: Uuid, error: SelectError },
}

impl TickOutcome {
  pub fn report(&self) -> Option<&TickReport> {
    match self {
      TickOutcome::Completed(report) => Some(report),
      _ => None,
    }
  }

  pub fn is_skipped(&self) -> bool {
    matches!(self, TickOutcome::Skipped)
  }
}

/// Clears the in-flight marker when the running tick ends, however it ends.
struct RunningGuard<'a> {
  in_flight: &'a AtomicBool,
}

impl<'a> RunningGuard<'a> {
  fn try_acquire(in_flight: &'a AtomicBool) -> Option<Self> {
    in_flight
      .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
      .ok()
      .map(|_| Self { in_flight })
  }
}

impl Drop for RunningGuard<'_> {
  fn drop(&mut self) {
    self.in_flight.store(false, AtomicOrdering::Release);
  }
}

struct MutationResult {
  change: TargetChange,
  persisted: Result<(), PersistError>,
}

/// Runs ticks and run-now requests against injected collaborators.
pub struct TickRunner {
  resolver: Arc<dyn TargetResolver>,
  flag: Arc<dyn MaintenanceFlag>,
  clock: Arc<dyn Clock>,
  evaluator: Arc<dyn FireTimeEvaluator>,
  schedules: ScheduleSet,
  tick_period: Duration,
  run_all_due: bool,
  metrics: EngineMetrics,
  in_flight: AtomicBool,
  // serializes pipelines from ticks and run-now
  apply_lock: tokio::sync::Mutex<()>,
  last_report: Mutex<Option<TickReport>>,
}

impl std::fmt::Debug for TickRunner {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TickRunner")
      .field("tick_period", &self.tick_period)
      .field("run_all_due", &self.run_all_due)
      .field("schedules", &self.schedules.names())
      .field("running", &self.is_running())
      .finish()
  }
}

impl TickRunner {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    resolver: Arc<dyn TargetResolver>,
    flag: Arc<dyn MaintenanceFlag>,
    clock: Arc<dyn Clock>,
    evaluator: Arc<dyn FireTimeEvaluator>,
    schedules: ScheduleSet,
    tick_period: Duration,
    run_all_due: bool,
    metrics: EngineMetrics,
  ) -> Self {
    Self {
      resolver,
      flag,
      clock,
      evaluator,
      schedules,
      tick_period,
      run_all_due,
      metrics,
      in_flight: AtomicBool::new(false),
      apply_lock: tokio::sync::Mutex::new(()),
      last_report: Mutex::new(None),
    }
  }

  pub fn schedules(&self) -> &ScheduleSet {
    &self.schedules
  }

  pub fn metrics(&self) -> &EngineMetrics {
    &self.metrics
  }

  pub fn tick_period(&self) -> Duration {
    self.tick_period
  }

  /// Whether a tick is in flight.
  pub fn is_running(&self) -> bool {
    self.in_flight.load(AtomicOrdering::Acquire)
  }

  /// The report of the most recent completed tick.
  pub fn last_report(&self) -> Option<TickReport> {
    self.last_report.lock().clone()
  }

  /// Runs one tick, unless one is already in flight.
  pub async fn tick(&self) -> TickOutcome {
    let Some(_running) = RunningGuard::try_acquire(&self.in_flight) else {
      warn!("Previous tick is still running; skipping this tick.");
      EngineMetrics::incr(&self.metrics.ticks_skipped);
      return TickOutcome::Skipped;
    };
    let tick_id = Uuid::new_v4();
    self
      .run_tick(tick_id)
      .instrument(info_span!("tick", %tick_id))
      .await
  }

  async fn run_tick(&self, tick_id: Uuid) -> TickOutcome {
    EngineMetrics::incr(&self.metrics.ticks_started);
    let started = Instant::now();
    let now = self.clock.now();
    let schedules = self.schedules.snapshot();
    debug!(schedules = schedules.len(), %now, "Tick started.");

    let selection = match Selection::evaluate_with(self.evaluator.as_ref(), now, &schedules) {
      Ok(selection) => selection,
      Err(error) => {
        error!(%error, "Aborting tick before any mutation.");
        EngineMetrics::incr(&self.metrics.ticks_aborted);
        self.metrics.tick_duration.record(started.elapsed());
        return TickOutcome::Aborted { tick_id, error };
      }
    };
    EngineMetrics::add(
      &self.metrics.invalid_expressions,
      selection.excluded.len(),
    );

    let due: Vec<Schedule> = if self.run_all_due {
      selection
        .all_due(self.tick_period)
        .into_iter()
        .map(|c| c.schedule().clone())
        .collect()
    } else {
      selection
        .due(self.tick_period)
        .map(|c| c.schedule().clone())
        .into_iter()
        .collect()
    };

    let mut reports = Vec::with_capacity(due.len());
    if due.is_empty() {
      debug!("Nothing due.");
    } else {
      let _apply = self.apply_lock.lock().await;
      for schedule in &due {
        info!(schedule = %schedule, "Schedule is due.");
        reports.push(
          self
            .apply_schedule(schedule, tick_id, Trigger::Periodic)
            .await,
        );
      }
    }

    let duration = started.elapsed();
    self.metrics.tick_duration.record(duration);
    EngineMetrics::incr(&self.metrics.ticks_completed);
    debug!(
      duration_ms = duration.as_millis() as u64,
      applied = reports.len(),
      "Tick finished."
    );

    let report = TickReport {
      tick_id,
      started_at: now,
      duration,
      schedules: reports,
      excluded: selection.excluded,
    };
    *self.last_report.lock() = Some(report.clone());
    TickOutcome::Completed(report)
  }

  /// Runs the full pipeline for `schedule` right away, whether or not it is
  /// due, and returns the first error any target produced.
  ///
  /// Waits for an in-flight tick's pipeline to finish first. The maintenance
  /// flag is restored before this returns, error or not.
  pub async fn run_now(&self, schedule: &Schedule) -> Result<ScheduleReport, RunNowError> {
    let tick_id = Uuid::new_v4();
    let report = async {
      let _apply = self.apply_lock.lock().await;
      info!(schedule = %schedule, "Running schedule on request.");
      self.apply_schedule(schedule, tick_id, Trigger::Manual).await
    }
    .instrument(info_span!("run_now", %tick_id))
    .await;

    match report.first_error().cloned() {
      Some(source) => Err(RunNowError {
        schedule: schedule.name().to_string(),
        source,
        report,
      }),
      None => Ok(report),
    }
  }

  async fn apply_schedule(
    &self,
    schedule: &Schedule,
    tick_id: Uuid,
    trigger: Trigger,
  ) -> ScheduleReport {
    let span = info_span!("schedule", schedule = %schedule.name(), action = %schedule.action());
    async {
      let window = MaintenanceWindow::enter(Arc::clone(&self.flag), schedule.name());
      let mut report = ScheduleReport::new(schedule.name(), trigger, window.was_set());
      let labels: Arc<[String]> = schedule.labels().into();

      for (position, target_ref) in schedule.targets().iter().enumerate() {
        let name = target_ref.name();
        let Some(target) = self.resolver.resolve(name) else {
          error!(node = %name, "Target could not be resolved; skipping.");
          EngineMetrics::incr(&self.metrics.targets_skipped);
          report.outcomes.push(TargetOutcome::Skipped {
            target: name.to_string(),
            reason: MutationError::UnresolvableTarget {
              name: name.to_string(),
            },
          });
          continue;
        };

        let kind = target.kind();
        if !kind.is_mutable() {
          error!(node = %name, %kind, "Target kind cannot be mutated; skipping.");
          EngineMetrics::incr(&self.metrics.targets_skipped);
          report.outcomes.push(TargetOutcome::Skipped {
            target: name.to_string(),
            reason: MutationError::UnsupportedTargetKind {
              name: name.to_string(),
              kind: kind.to_string(),
            },
          });
          continue;
        }

        let mutation = mutate_target(
          target,
          schedule.action(),
          Arc::clone(&labels),
          target_ref.capacity(),
        );

        #[cfg(feature = "tick_context")]
        let task = {
          let context = TickContext {
            tick_id,
            schedule: schedule.name().to_string(),
            trigger,
          };
          tokio::spawn(CURRENT_TICK_CONTEXT.scope(context, mutation))
        };
        #[cfg(not(feature = "tick_context"))]
        let task = {
          let _ = tick_id;
          tokio::spawn(mutation)
        };

        match task.await {
          Ok(MutationResult { change, persisted }) => {
            EngineMetrics::incr(&self.metrics.targets_mutated);
            if change.resize.as_ref().is_some_and(ResizeOutcome::changed) {
              EngineMetrics::incr(&self.metrics.capacity_resizes);
            }
            match persisted {
              Ok(()) => report.outcomes.push(TargetOutcome::Applied(change)),
              Err(source) => {
                error!(node = %name, error = %source, "Failed to persist target; in-memory change kept.");
                EngineMetrics::incr(&self.metrics.persistence_failures);
                report.outcomes.push(TargetOutcome::Unsaved {
                  reason: MutationError::PersistenceFailed {
                    target: change.target.clone(),
                    source,
                  },
                  change,
                });
              }
            }
          }
          Err(join_error) => {
            let reason = MutationError::MutationFailed {
              schedule: schedule.name().to_string(),
              target: name.to_string(),
              reason: describe_join_error(join_error),
            };
            error!(error = %reason, "Mutation failed; abandoning the schedule's remaining targets.");
            EngineMetrics::incr(&self.metrics.mutation_failures);
            report.outcomes.push(TargetOutcome::Failed {
              target: name.to_string(),
              reason,
            });
            report.unvisited = schedule.targets()[position + 1..]
              .iter()
              .map(|t| t.name().to_string())
              .collect();
            break;
          }
        }
      }

      drop(window);
      EngineMetrics::incr(&self.metrics.schedules_applied);
      debug!(
        visited = report.outcomes.len(),
        unvisited = report.unvisited.len(),
        "Schedule pipeline finished."
      );
      report
    }
    .instrument(span)
    .await
  }
}

/// Rewrites one target's labels, resizes its pool if asked, then saves it.
async fn mutate_target(
  target: Arc<dyn Target>,
  action: LabelAction,
  labels: Arc<[String]>,
  capacity: Option<usize>,
) -> MutationResult {
  let name = target.name().to_string();
  let labels_before = target.label_string();
  let labels_after = labels::mutate(&labels_before, action, &labels[..]);
  target.set_label_string(labels_after.clone());
  debug!(node = %name, from = %labels_before, to = %labels_after, "Labels updated.");

  let resize = match (capacity, target.worker_pool()) {
    (Some(requested), Some(pool)) => Some(pool::resize(&pool, requested)),
    (Some(requested), None) => {
      warn!(node = %name, requested, "Target has no worker pool; capacity request ignored.");
      None
    }
    (None, _) => None,
  };

  let persisted = target.persist().await;
  MutationResult {
    change: TargetChange {
      target: name,
      kind: target.kind(),
      labels_before,
      labels_after,
      resize,
    },
    persisted,
  }
}

fn describe_join_error(join_error: JoinError) -> String {
  if !join_error.is_panic() {
    return "mutation task was cancelled".to_string();
  }
  let payload = join_error.into_panic();
  if let Some(message) = payload.downcast_ref::<&str>() {
    format!("panicked: {message}")
  } else if let Some(message) = payload.downcast_ref::<String>() {
    format!("panicked: {message}")
  } else {
    "panicked".to_string()
  }
}
