//! tests/scheduler.rs
//! Builder validation, the periodic loop, pause/resume and shutdown.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::common::{at, builder_for, registry_with, setup_tracing, GatedNode};
use labelkeeper::{
  BuildError, LabelAction, LabelScheduler, MaintenanceFlag, ManualClock, QuietMode, Schedule,
  ShutdownError, Target, TickOutcome,
};

fn monday_ten() -> Arc<ManualClock> {
  Arc::new(ManualClock::new(at("2024-03-04T10:00:00Z")))
}

#[test]
fn test_builder_requires_collaborators() {
  let (registry, _) = registry_with(&[]);
  let flag = Arc::new(QuietMode::default());

  let err = LabelScheduler::builder()
    .maintenance_flag(flag.clone())
    .build_runner()
    .unwrap_err();
  assert_eq!(err, BuildError::MissingResolver);

  let err = LabelScheduler::builder()
    .resolver(registry.clone())
    .build_runner()
    .unwrap_err();
  assert_eq!(err, BuildError::MissingMaintenanceFlag);

  let err = LabelScheduler::builder()
    .resolver(registry)
    .maintenance_flag(flag)
    .tick_period(StdDuration::ZERO)
    .build_runner()
    .unwrap_err();
  assert_eq!(err, BuildError::ZeroTickPeriod);
}

#[test]
fn test_build_outside_runtime_fails() {
  let (registry, _) = registry_with(&[]);
  let err = builder_for(registry, Arc::new(QuietMode::default()), monday_ten(), vec![])
    .build()
    .unwrap_err();
  assert_eq!(err, BuildError::NoRuntime);
}

#[tokio::test(start_paused = true)]
async fn test_loop_ticks_once_per_period() {
  setup_tracing();
  let (registry, nodes) = registry_with(&[("n1", "a")]);
  let scheduler = builder_for(
    registry,
    Arc::new(QuietMode::default()),
    monday_ten(),
    vec![Schedule::new("s", "* * * * *", LabelAction::Add, "b", "n1")],
  )
  .build()
  .unwrap();

  tokio::time::sleep(StdDuration::from_secs(30)).await;
  assert_eq!(nodes[0].saves(), 0, "first tick fires one period after build");

  tokio::time::sleep(StdDuration::from_secs(31)).await;
  assert_eq!(nodes[0].saves(), 1);
  assert_eq!(nodes[0].label_string(), "a b");

  tokio::time::sleep(StdDuration::from_secs(60)).await;
  assert_eq!(nodes[0].saves(), 2);
  assert_eq!(nodes[0].label_string(), "a b");

  let metrics = scheduler.metrics_snapshot();
  assert_eq!(metrics.ticks_completed, 2);
  assert!(scheduler.last_tick().is_some());

  scheduler.shutdown(Some(StdDuration::from_secs(1))).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pause_drops_ticks_until_resumed() {
  let (registry, nodes) = registry_with(&[("n1", "a")]);
  let scheduler = builder_for(
    registry,
    Arc::new(QuietMode::default()),
    monday_ten(),
    vec![Schedule::new("s", "* * * * *", LabelAction::Add, "b", "n1")],
  )
  .start_paused(true)
  .build()
  .unwrap();
  assert!(scheduler.is_paused());

  tokio::time::sleep(StdDuration::from_secs(121)).await;
  assert_eq!(scheduler.metrics_snapshot().ticks_started, 0);

  // Manual triggers still work while paused.
  let outcome = scheduler.trigger_tick().await;
  assert!(matches!(outcome, TickOutcome::Completed(_)));
  assert_eq!(nodes[0].saves(), 1);

  scheduler.resume();
  tokio::time::sleep(StdDuration::from_secs(60)).await;
  assert_eq!(scheduler.metrics_snapshot().ticks_started, 2);

  scheduler.pause();
  tokio::time::sleep(StdDuration::from_secs(120)).await;
  assert_eq!(scheduler.metrics_snapshot().ticks_started, 2);

  scheduler.shutdown(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_schedule_edits_apply_to_next_tick() {
  let (registry, nodes) = registry_with(&[("n1", "a")]);
  let scheduler = builder_for(
    registry,
    Arc::new(QuietMode::default()),
    monday_ten(),
    vec![Schedule::new("s", "30 10 * * *", LabelAction::Add, "b", "n1")],
  )
  .build()
  .unwrap();

  assert!(scheduler.trigger_tick().await.report().unwrap().schedules.is_empty());

  scheduler
    .schedules()
    .upsert(Schedule::new("s", "* * * * *", LabelAction::Replace, "new", "n1"));
  let outcome = scheduler.trigger_tick().await;
  assert_eq!(outcome.report().unwrap().schedules.len(), 1);
  assert_eq!(nodes[0].label_string(), "new");

  scheduler.shutdown(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_in_flight_tick() {
  setup_tracing();
  let (registry, _) = registry_with(&[]);
  let gated = Arc::new(GatedNode::new("slow", "a"));
  registry.insert(gated.clone());
  let flag = Arc::new(QuietMode::default());
  let scheduler = builder_for(
    registry,
    flag.clone(),
    monday_ten(),
    vec![Schedule::new("s", "* * * * *", LabelAction::Add, "b", "slow")],
  )
  .build()
  .unwrap();

  tokio::time::sleep(StdDuration::from_secs(61)).await;
  assert!(gated.entered.load(Ordering::SeqCst));
  assert!(flag.is_set());

  let releaser = {
    let gated = gated.clone();
    tokio::spawn(async move {
      tokio::time::sleep(StdDuration::from_secs(5)).await;
      gated.gate.notify_one();
    })
  };
  scheduler.shutdown(None).await.unwrap();
  releaser.await.unwrap();

  assert_eq!(gated.label_string(), "a b");
  assert!(!flag.is_set());
  assert_eq!(
    scheduler.shutdown(None).await.unwrap_err(),
    ShutdownError::AlreadyShutDown
  );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_times_out_on_stuck_tick() {
  let (registry, _) = registry_with(&[]);
  let gated = Arc::new(GatedNode::new("stuck", "a"));
  registry.insert(gated.clone());
  let scheduler = builder_for(
    registry,
    Arc::new(QuietMode::default()),
    monday_ten(),
    vec![Schedule::new("s", "* * * * *", LabelAction::Add, "b", "stuck")],
  )
  .build()
  .unwrap();

  tokio::time::sleep(StdDuration::from_secs(61)).await;
  assert!(gated.entered.load(Ordering::SeqCst));

  let err = scheduler
    .shutdown(Some(StdDuration::from_secs(2)))
    .await
    .unwrap_err();
  assert_eq!(err, ShutdownError::Timeout);
  gated.gate.notify_one();
}
