//! tests/common.rs
//! Shared helper functions for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use labelkeeper::{
  ManualClock, MemoryNode, NodeRegistry, PersistError, QuietMode, Schedule, SchedulerBuilder,
  Target, TickRunner,
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing_subscriber::fmt::TestWriter;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// Parses an RFC 3339 instant. 2024-03-04 is a Monday.
pub fn at(rfc3339: &str) -> DateTime<Utc> {
  DateTime::parse_from_rfc3339(rfc3339)
    .expect("valid test timestamp")
    .with_timezone(&Utc)
}

// A registry with in-memory nodes; returns the typed handles too.
pub fn registry_with(nodes: &[(&str, &str)]) -> (Arc<NodeRegistry>, Vec<Arc<MemoryNode>>) {
  let registry = Arc::new(NodeRegistry::with_controller_labels("built-in"));
  let handles = nodes
    .iter()
    .map(|(name, labels)| {
      let node = Arc::new(MemoryNode::new(*name, labels));
      registry.insert(node.clone());
      node
    })
    .collect();
  (registry, handles)
}

// Builder pre-wired with a registry, a flag and a manual clock.
pub fn builder_for(
  registry: Arc<NodeRegistry>,
  flag: Arc<QuietMode>,
  clock: Arc<ManualClock>,
  schedules: Vec<Schedule>,
) -> SchedulerBuilder {
  SchedulerBuilder::new()
    .resolver(registry)
    .maintenance_flag(flag)
    .clock(clock)
    .schedules(schedules)
}

pub fn runner_for(
  registry: Arc<NodeRegistry>,
  flag: Arc<QuietMode>,
  clock: Arc<ManualClock>,
  schedules: Vec<Schedule>,
) -> TickRunner {
  builder_for(registry, flag, clock, schedules)
    .build_runner()
    .expect("runner should build")
}

// Polls `cond` until it holds, yielding in between. Fails after `limit`.
pub async fn wait_until(limit: StdDuration, cond: impl Fn() -> bool) {
  tokio::time::timeout(limit, async {
    while !cond() {
      tokio::time::sleep(StdDuration::from_millis(2)).await;
    }
  })
  .await
  .expect("condition not reached in time");
}

// A node whose persist blocks until released.
pub struct GatedNode {
  name: String,
  labels: Mutex<String>,
  pub entered: AtomicBool,
  pub gate: Notify,
}

impl GatedNode {
  pub fn new(name: &str, labels: &str) -> Self {
    Self {
      name: name.to_string(),
      labels: Mutex::new(labels.to_string()),
      entered: AtomicBool::new(false),
      gate: Notify::new(),
    }
  }
}

impl Target for GatedNode {
  fn name(&self) -> &str {
    &self.name
  }

  fn label_string(&self) -> String {
    self.labels.lock().clone()
  }

  fn set_label_string(&self, labels: String) {
    *self.labels.lock() = labels;
  }

  fn persist(&self) -> BoxFuture<'_, Result<(), PersistError>> {
    async move {
      self.entered.store(true, Ordering::SeqCst);
      self.gate.notified().await;
      Ok(())
    }
    .boxed()
  }
}

// A node that panics when its labels are written.
pub struct PanickingNode {
  name: String,
  pub attempts: AtomicUsize,
}

impl PanickingNode {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      attempts: AtomicUsize::new(0),
    }
  }
}

impl Target for PanickingNode {
  fn name(&self) -> &str {
    &self.name
  }

  fn label_string(&self) -> String {
    String::new()
  }

  fn set_label_string(&self, _labels: String) {
    self.attempts.fetch_add(1, Ordering::SeqCst);
    panic!("label store exploded");
  }

  fn persist(&self) -> BoxFuture<'_, Result<(), PersistError>> {
    async { Ok(()) }.boxed()
  }
}
