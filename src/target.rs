//! Targets: the entities whose labels and capacity a schedule mutates.
//!
//! The engine only sees targets through [`Target`] and looks them up by name
//! through a [`TargetResolver`] each time a schedule runs; resolved handles
//! are never stored on a schedule. [`NodeRegistry`] and [`MemoryNode`] are
//! in-memory implementations for hosts without their own node model.

use crate::error::PersistError;
use crate::pool::SlotPool;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use tracing::warn;

/// Name of the controller target. Matched case-insensitively.
pub const MASTER_TARGET: &str = "master";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TargetKind {
  /// An agent node.
  Node,
  /// The controller itself, addressed as `master`.
  Controller,
  /// Something that resolves by name but has no label set of its own
  /// (a cloud template, a lockable resource). Never mutated.
  Resource,
}

impl TargetKind {
  pub fn is_mutable(self) -> bool {
    !matches!(self, TargetKind::Resource)
  }
}

impl fmt::Display for TargetKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      TargetKind::Node => "node",
      TargetKind::Controller => "controller",
      TargetKind::Resource => "resource",
    };
    f.write_str(s)
  }
}

/// A live, addressable entity with a label string and optionally a worker
/// pool.
pub trait Target: Send + Sync {
  fn name(&self) -> &str;

  fn kind(&self) -> TargetKind {
    TargetKind::Node
  }

  fn label_string(&self) -> String;

  fn set_label_string(&self, labels: String);

  /// The target's worker pool. Targets without one never get a capacity
  /// resize.
  fn worker_pool(&self) -> Option<Arc<SlotPool>> {
    None
  }

  fn is_online(&self) -> bool {
    true
  }

  /// Saves the target's current labels and capacity.
  fn persist(&self) -> BoxFuture<'_, Result<(), PersistError>>;
}

/// Looks targets up by name.
pub trait TargetResolver: Send + Sync {
  /// Resolves `name`. The master name must match case-insensitively.
  fn resolve(&self, name: &str) -> Option<Arc<dyn Target>>;

  fn target_names(&self) -> Vec<String>;
}

/// An in-memory target.
#[derive(Debug)]
pub struct MemoryNode {
  name: String,
  kind: TargetKind,
  labels: RwLock<String>,
  pool: Option<Arc<SlotPool>>,
  online: AtomicBool,
  saves: AtomicUsize,
  persist_failure: Mutex<Option<String>>,
}

impl MemoryNode {
  pub fn new(name: impl Into<String>, labels: &str) -> Self {
    Self {
      name: name.into(),
      kind: TargetKind::Node,
      labels: RwLock::new(labels.to_string()),
      pool: None,
      online: AtomicBool::new(true),
      saves: AtomicUsize::new(0),
      persist_failure: Mutex::new(None),
    }
  }

  /// The controller target, named `master`.
  pub fn controller(labels: &str) -> Self {
    Self::new(MASTER_TARGET, labels).with_kind(TargetKind::Controller)
  }

  pub fn with_kind(mut self, kind: TargetKind) -> Self {
    self.kind = kind;
    self
  }

  /// Attaches a fresh pool of `count` idle slots.
  pub fn with_slots(self, count: usize) -> Self {
    let pool = Arc::new(SlotPool::new(self.name.clone(), count));
    self.with_pool(pool)
  }

  pub fn with_pool(mut self, pool: Arc<SlotPool>) -> Self {
    self.pool = Some(pool);
    self
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Makes every following `persist` fail with `message`, or succeed again
  /// with `None`.
  pub fn set_persist_failure(&self, message: Option<&str>) {
    *self.persist_failure.lock() = message.map(str::to_string);
  }

  /// Number of successful saves.
  pub fn saves(&self) -> usize {
    self.saves.load(Ordering::SeqCst)
  }
}

impl Target for MemoryNode {
  fn name(&self) -> &str {
    &self.name
  }

  fn kind(&self) -> TargetKind {
    self.kind
  }

  fn label_string(&self) -> String {
    self.labels.read().clone()
  }

  fn set_label_string(&self, labels: String) {
    *self.labels.write() = labels;
  }

  fn worker_pool(&self) -> Option<Arc<SlotPool>> {
    self.pool.clone()
  }

  fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  fn persist(&self) -> BoxFuture<'_, Result<(), PersistError>> {
    async move {
      let failure = self.persist_failure.lock().clone();
      if let Some(message) = failure {
        return Err(PersistError::new(message));
      }
      self.saves.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
    .boxed()
  }
}

/// A name-indexed set of targets with a distinguished controller.
pub struct NodeRegistry {
  controller: Arc<dyn Target>,
  nodes: RwLock<Vec<Arc<dyn Target>>>,
}

impl fmt::Debug for NodeRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NodeRegistry")
      .field("nodes", &self.node_names())
      .finish()
  }
}

impl NodeRegistry {
  pub fn new(controller: Arc<dyn Target>) -> Self {
    Self {
      controller,
      nodes: RwLock::new(Vec::new()),
    }
  }

  /// A registry whose controller is an in-memory node carrying `labels`.
  pub fn with_controller_labels(labels: &str) -> Self {
    Self::new(Arc::new(MemoryNode::controller(labels)))
  }

  /// Adds a node, replacing any node with the same name. Returns the
  /// replaced node.
  pub fn insert(&self, node: Arc<dyn Target>) -> Option<Arc<dyn Target>> {
    if node.name().eq_ignore_ascii_case(MASTER_TARGET) {
      warn!(node = %node.name(), "Ignoring node named like the controller.");
      return None;
    }
    let mut nodes = self.nodes.write();
    match nodes.iter_mut().find(|n| n.name() == node.name()) {
      Some(existing) => Some(std::mem::replace(existing, node)),
      None => {
        nodes.push(node);
        None
      }
    }
  }

  pub fn remove(&self, name: &str) -> Option<Arc<dyn Target>> {
    let mut nodes = self.nodes.write();
    let index = nodes.iter().position(|n| n.name() == name)?;
    Some(nodes.remove(index))
  }

  pub fn controller(&self) -> Arc<dyn Target> {
    Arc::clone(&self.controller)
  }

  /// All node names in insertion order, followed by `master`.
  pub fn node_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self
      .nodes
      .read()
      .iter()
      .map(|n| n.name().to_string())
      .collect();
    names.push(MASTER_TARGET.to_string());
    names
  }

  /// Whether `name` can take work. The controller always can; a node must
  /// exist, be online and have at least one slot.
  pub fn is_online(&self, name: &str) -> bool {
    if name.eq_ignore_ascii_case(MASTER_TARGET) {
      return true;
    }
    let nodes = self.nodes.read();
    match nodes.iter().find(|n| n.name() == name) {
      Some(node) => {
        node.is_online()
          && node
            .worker_pool()
            .is_some_and(|pool| pool.current_slot_count() > 0)
      }
      None => false,
    }
  }
}

impl TargetResolver for NodeRegistry {
  fn resolve(&self, name: &str) -> Option<Arc<dyn Target>> {
    if name.eq_ignore_ascii_case(MASTER_TARGET) {
      return Some(self.controller());
    }
    self
      .nodes
      .read()
      .iter()
      .find(|n| n.name() == name)
      .cloned()
  }

  fn target_names(&self) -> Vec<String> {
    self.node_names()
  }
}
