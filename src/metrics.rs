use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A concurrent histogram storing observation count and sum.
///
/// Enough for mean latency; no percentiles.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Sum of recorded durations in microseconds.
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

/// Atomic counters shared by the tick loop, the runner and the handle.
///
/// Cloning only clones the `Arc`s.
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
  /// Ticks that entered the running state.
  pub ticks_started: Arc<AtomicUsize>,
  pub ticks_completed: Arc<AtomicUsize>,
  /// Ticks dropped because the previous tick was still running.
  pub ticks_skipped: Arc<AtomicUsize>,
  /// Ticks aborted by a clock regression.
  pub ticks_aborted: Arc<AtomicUsize>,
  /// Schedule pipelines run, by tick or run-now.
  pub schedules_applied: Arc<AtomicUsize>,
  pub targets_mutated: Arc<AtomicUsize>,
  /// Unresolvable or unsupported targets.
  pub targets_skipped: Arc<AtomicUsize>,
  pub capacity_resizes: Arc<AtomicUsize>,
  pub persistence_failures: Arc<AtomicUsize>,
  pub mutation_failures: Arc<AtomicUsize>,
  /// Schedules excluded from selection for an unusable expression.
  pub invalid_expressions: Arc<AtomicUsize>,

  pub tick_duration: Arc<SimpleHistogram>,
}

impl EngineMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn add(counter: &AtomicUsize, n: usize) {
    counter.fetch_add(n, Ordering::Relaxed);
  }

  /// Point-in-time copy of every counter.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      ticks_started: self.ticks_started.load(order),
      ticks_completed: self.ticks_completed.load(order),
      ticks_skipped: self.ticks_skipped.load(order),
      ticks_aborted: self.ticks_aborted.load(order),
      schedules_applied: self.schedules_applied.load(order),
      targets_mutated: self.targets_mutated.load(order),
      targets_skipped: self.targets_skipped.load(order),
      capacity_resizes: self.capacity_resizes.load(order),
      persistence_failures: self.persistence_failures.load(order),
      mutation_failures: self.mutation_failures.load(order),
      invalid_expressions: self.invalid_expressions.load(order),
      tick_duration_count: self.tick_duration.get_count(),
      tick_duration_sum_micros: self.tick_duration.get_sum_micros(),
    }
  }
}

/// A snapshot of the engine's metrics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
  pub ticks_started: usize,
  pub ticks_completed: usize,
  pub ticks_skipped: usize,
  pub ticks_aborted: usize,
  pub schedules_applied: usize,
  pub targets_mutated: usize,
  pub targets_skipped: usize,
  pub capacity_resizes: usize,
  pub persistence_failures: usize,
  pub mutation_failures: usize,
  pub invalid_expressions: usize,
  pub tick_duration_count: usize,
  pub tick_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean tick duration in microseconds. `None` before the first recorded
  /// tick.
  pub fn mean_tick_duration_micros(&self) -> Option<f64> {
    if self.tick_duration_count == 0 {
      None
    } else {
      Some(self.tick_duration_sum_micros as f64 / self.tick_duration_count as f64)
    }
  }

  pub fn mean_tick_duration(&self) -> Option<Duration> {
    self
      .mean_tick_duration_micros()
      .map(|micros| Duration::from_micros(micros as u64))
  }
}
