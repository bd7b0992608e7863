use crate::clock::{Clock, SystemClock};
use crate::error::{BuildError, RunNowError, ShutdownError};
use crate::maintenance::MaintenanceFlag;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::runner::{ScheduleReport, TickOutcome, TickReport, TickRunner};
use crate::schedule::{Schedule, ScheduleSet};
use crate::selector::{CronEvaluator, FireTimeEvaluator};
use crate::target::TargetResolver;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Default tick period, which is also the eligibility threshold for due
/// schedules.
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(60);

/// Builder for configuring and creating a [`LabelScheduler`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use labelkeeper::{LabelScheduler, LabelAction, NodeRegistry, QuietMode, Schedule};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = Arc::new(NodeRegistry::with_controller_labels("built-in"));
/// let scheduler = LabelScheduler::builder()
///     .resolver(registry)
///     .maintenance_flag(Arc::new(QuietMode::default()))
///     .schedules([Schedule::new("nightly", "0 22 * * *", LabelAction::Replace, "night", "agent-1")])
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct SchedulerBuilder {
  tick_period: Duration,
  resolver: Option<Arc<dyn TargetResolver>>,
  maintenance_flag: Option<Arc<dyn MaintenanceFlag>>,
  clock: Option<Arc<dyn Clock>>,
  evaluator: Option<Arc<dyn FireTimeEvaluator>>,
  schedules: Vec<Schedule>,
  start_paused: bool,
  run_all_due: bool,
}

impl Default for SchedulerBuilder {
  fn default() -> Self {
    Self {
      tick_period: DEFAULT_TICK_PERIOD,
      resolver: None,
      maintenance_flag: None,
      clock: None,
      evaluator: None,
      schedules: Vec::new(),
      start_paused: false,
      run_all_due: false,
    }
  }
}

impl fmt::Debug for SchedulerBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SchedulerBuilder")
      .field("tick_period", &self.tick_period)
      .field("resolver", &self.resolver.is_some())
      .field("maintenance_flag", &self.maintenance_flag.is_some())
      .field("clock", &self.clock.is_some())
      .field("evaluator", &self.evaluator.is_some())
      .field("schedules", &self.schedules.len())
      .field("start_paused", &self.start_paused)
      .field("run_all_due", &self.run_all_due)
      .finish()
  }
}

impl SchedulerBuilder {
  /// Creates a new builder with default settings.
  /// - `tick_period`: 60 seconds.
  /// - `resolver`, `maintenance_flag`: not set (required).
  /// - `clock`: [`SystemClock`].
  /// - `evaluator`: [`CronEvaluator`].
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets how often the loop ticks. A schedule is due when its next fire
  /// time is less than one period away.
  pub fn tick_period(mut self, period: Duration) -> Self {
    self.tick_period = period;
    self
  }

  /// Sets the target lookup (required).
  pub fn resolver(mut self, resolver: Arc<dyn TargetResolver>) -> Self {
    self.resolver = Some(resolver);
    self
  }

  /// Sets the system-wide maintenance flag (required).
  pub fn maintenance_flag(mut self, flag: Arc<dyn MaintenanceFlag>) -> Self {
    self.maintenance_flag = Some(flag);
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = Some(clock);
    self
  }

  /// Replaces how fire times are computed. Defaults to each schedule's own
  /// cron expression.
  pub fn evaluator(mut self, evaluator: Arc<dyn FireTimeEvaluator>) -> Self {
    self.evaluator = Some(evaluator);
    self
  }

  /// Sets the initial schedules, in tie-break order. Only the first schedule
  /// of any name is kept. Schedules are not validated here; one with an
  /// unusable expression is simply never selected.
  pub fn schedules(mut self, schedules: impl IntoIterator<Item = Schedule>) -> Self {
    self.schedules = schedules.into_iter().collect();
    self
  }

  /// Starts the loop paused; ticks are dropped until [`LabelScheduler::resume`].
  pub fn start_paused(mut self, paused: bool) -> Self {
    self.start_paused = paused;
    self
  }

  /// Runs every schedule due in a tick (earliest first) instead of only the
  /// earliest one.
  pub fn run_all_due(mut self, enabled: bool) -> Self {
    self.run_all_due = enabled;
    self
  }

  /// Builds a [`TickRunner`] without starting a loop, for hosts that drive
  /// ticks themselves.
  ///
  /// # Errors
  ///
  /// Returns a [`BuildError`] for a zero tick period or a missing resolver or
  /// maintenance flag.
  pub fn build_runner(self) -> Result<TickRunner, BuildError> {
    if self.tick_period.is_zero() {
      return Err(BuildError::ZeroTickPeriod);
    }
    let resolver = self.resolver.ok_or(BuildError::MissingResolver)?;
    let flag = self
      .maintenance_flag
      .ok_or(BuildError::MissingMaintenanceFlag)?;
    let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
    let evaluator = self.evaluator.unwrap_or_else(|| Arc::new(CronEvaluator));

    Ok(TickRunner::new(
      resolver,
      flag,
      clock,
      evaluator,
      ScheduleSet::from_schedules(self.schedules),
      self.tick_period,
      self.run_all_due,
      EngineMetrics::new(),
    ))
  }

  /// Builds the scheduler and spawns its tick loop on the current Tokio
  /// runtime. The first tick fires one period after this call.
  ///
  /// # Errors
  ///
  /// As [`build_runner`](Self::build_runner), plus [`BuildError::NoRuntime`]
  /// outside a Tokio runtime.
  pub fn build(self) -> Result<LabelScheduler, BuildError> {
    let handle = Handle::try_current().map_err(|_| BuildError::NoRuntime)?;
    let start_paused = self.start_paused;
    let runner = Arc::new(self.build_runner()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let paused = Arc::new(AtomicBool::new(start_paused));
    let tick_handles = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let loop_handle = handle.spawn(tick_loop(
      runner.clone(),
      shutdown_rx,
      paused.clone(),
      tick_handles.clone(),
    ));
    info!(tick_period = ?runner.tick_period(), paused = start_paused, "Label scheduler started.");

    Ok(LabelScheduler {
      runner,
      shutdown_tx,
      paused,
      loop_handle: Arc::new(Mutex::new(Some(loop_handle))),
      tick_handles,
    })
  }
}

/// Fires one tick per period until shutdown. Each tick runs on its own task
/// so a slow tick never delays the loop; the runner's single-flight guard
/// drops ticks that overlap.
async fn tick_loop(
  runner: Arc<TickRunner>,
  mut shutdown_rx: watch::Receiver<bool>,
  paused: Arc<AtomicBool>,
  tick_handles: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
) {
  let period = runner.tick_period();
  let mut interval = tokio::time::interval_at(Instant::now() + period, period);
  interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

  loop {
    tokio::select! {
      biased;
      changed = shutdown_rx.changed() => {
        if changed.is_err() || *shutdown_rx.borrow() {
          debug!("Tick loop received shutdown signal.");
          break;
        }
      }
      _ = interval.tick() => {
        if paused.load(AtomicOrdering::Acquire) {
          trace!("Scheduler paused; dropping tick.");
          continue;
        }
        let tick_runner = runner.clone();
        let tick = tokio::spawn(async move {
          tick_runner.tick().await;
        });
        let mut handles = tick_handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(tick);
      }
    }
  }
  info!("Tick loop stopped.");
}

/// A running label scheduler.
///
/// Use [`LabelScheduler::builder()`] to create one.
pub struct LabelScheduler {
  runner: Arc<TickRunner>,
  shutdown_tx: watch::Sender<bool>,
  paused: Arc<AtomicBool>,
  loop_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
  tick_handles: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
}

impl fmt::Debug for LabelScheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LabelScheduler")
      .field("runner", &self.runner)
      .field("paused", &self.is_paused())
      .finish()
  }
}

impl LabelScheduler {
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  pub fn runner(&self) -> &Arc<TickRunner> {
    &self.runner
  }

  /// The live schedule collection. Edits apply from the next tick.
  pub fn schedules(&self) -> &ScheduleSet {
    self.runner.schedules()
  }

  /// Runs a tick now, outside the period, honouring single-flight.
  pub async fn trigger_tick(&self) -> TickOutcome {
    self.runner.tick().await
  }

  /// Runs `schedule` now and surfaces its first error. See
  /// [`TickRunner::run_now`].
  pub async fn run_now(&self, schedule: &Schedule) -> Result<ScheduleReport, RunNowError> {
    self.runner.run_now(schedule).await
  }

  pub fn metrics_snapshot(&self) -> MetricsSnapshot {
    self.runner.metrics().snapshot()
  }

  /// The most recent completed tick.
  pub fn last_tick(&self) -> Option<TickReport> {
    self.runner.last_report()
  }

  /// Drops periodic ticks until [`resume`](Self::resume). A tick already
  /// running finishes normally; `trigger_tick` and `run_now` still work.
  pub fn pause(&self) {
    if !self.paused.swap(true, AtomicOrdering::AcqRel) {
      info!("Label scheduler paused.");
    }
  }

  pub fn resume(&self) {
    if self.paused.swap(false, AtomicOrdering::AcqRel) {
      info!("Label scheduler resumed.");
    }
  }

  pub fn is_paused(&self) -> bool {
    self.paused.load(AtomicOrdering::Acquire)
  }

  /// Stops the tick loop and waits for in-flight ticks to finish, or until
  /// `timeout` elapses.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::AlreadyShutDown`]: shutdown was already requested.
  /// - [`ShutdownError::SignalFailed`]: the loop had already stopped.
  /// - [`ShutdownError::Timeout`]: waiting exceeded `timeout`.
  /// - [`ShutdownError::TaskPanic`]: the loop or a tick task panicked.
  pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    if *self.shutdown_tx.borrow() {
      return Err(ShutdownError::AlreadyShutDown);
    }
    info!("Shutting down label scheduler...");
    self
      .shutdown_tx
      .send(true)
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(timeout).await
  }

  async fn await_shutdown(&self, timeout_duration: Option<Duration>) -> Result<(), ShutdownError> {
    let loop_handle = self.loop_handle.lock().await.take();
    let Some(loop_handle) = loop_handle else {
      warn!("Tick loop handle missing during shutdown wait.");
      return Err(ShutdownError::AlreadyShutDown);
    };

    let ticks_and_loop = async {
      loop_handle.await?;
      // the loop has stopped, so no new tick handles can appear
      let ticks = std::mem::take(&mut *self.tick_handles.lock());
      try_join_all(ticks).await.map(|_| ())
    };

    let result = match timeout_duration {
      Some(timeout) => match tokio::time::timeout(timeout, ticks_and_loop).await {
        Ok(joined) => joined.map_err(|join_err| {
          error!("A task panicked during shutdown: {:?}", join_err);
          ShutdownError::TaskPanic
        }),
        Err(_) => {
          error!("Shutdown timed out after {:?}", timeout);
          Err(ShutdownError::Timeout)
        }
      },
      None => ticks_and_loop.await.map_err(|join_err| {
        error!("A task panicked during shutdown: {:?}", join_err);
        ShutdownError::TaskPanic
      }),
    };

    if result.is_ok() {
      info!("Label scheduler stopped.");
    }
    result
  }
}
