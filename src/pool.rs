//! Worker slot pools and capacity resizing.
//!
//! A [`SlotPool`] owns the slots of one target. Work assignment
//! ([`SlotPool::acquire`]) and resizing ([`resize`]) take the same pool lock,
//! so a shrink can never interrupt a slot that is concurrently being handed
//! work.
//!
//! Shrinking is soft: only idle slots are interrupted. Busy slots keep
//! running and retire themselves when released while the pool is above its
//! requested capacity. Growing fills the lowest free indices first.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Point-in-time view of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SlotInfo {
  pub index: usize,
  pub idle: bool,
}

impl SlotInfo {
  pub fn idle(index: usize) -> Self {
    Self { index, idle: true }
  }

  pub fn busy(index: usize) -> Self {
    Self { index, idle: false }
  }
}

/// What a resize will do to a slot collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResizePlan {
  /// Idle slots to interrupt, ascending.
  pub interrupt: Vec<usize>,
  /// Indices to create, ascending.
  pub create: Vec<usize>,
}

impl ResizePlan {
  pub fn is_noop(&self) -> bool {
    self.interrupt.is_empty() && self.create.is_empty()
  }
}

/// Computes the resize plan for `slots` and a requested slot count.
///
/// - Shrink (more slots than requested): every idle slot is marked for
///   interruption, lowest index first. Busy slots are never touched.
/// - Grow: the lowest indices in `0..requested` not held by an existing slot
///   are created, until the slot count reaches `requested`.
/// - Equal: nothing.
pub fn plan_resize(slots: &[SlotInfo], requested: usize) -> ResizePlan {
  let current = slots.len();
  let mut plan = ResizePlan::default();
  if current > requested {
    plan.interrupt = slots.iter().filter(|s| s.idle).map(|s| s.index).collect();
    plan.interrupt.sort_unstable();
  } else if current < requested {
    plan.create = (0..requested)
      .filter(|index| !slots.iter().any(|s| s.index == *index))
      .take(requested - current)
      .collect();
  }
  plan
}

/// The result of applying a resize to a live pool.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResizeOutcome {
  pub previous: usize,
  pub requested: usize,
  pub interrupted: Vec<usize>,
  /// Slots created by the resize, including any replenished after
  /// interrupting idle slots.
  pub created: Vec<usize>,
  /// Slot count right after the resize. Above `requested` while busy slots
  /// are still draining.
  pub current: usize,
}

impl ResizeOutcome {
  pub fn changed(&self) -> bool {
    !self.interrupted.is_empty() || !self.created.is_empty()
  }

  pub fn converged(&self) -> bool {
    self.current == self.requested
  }
}

#[derive(Debug)]
struct SlotEntry {
  busy: bool,
  interrupt_tx: watch::Sender<bool>,
}

impl SlotEntry {
  fn new(busy: bool) -> Self {
    let (interrupt_tx, _) = watch::channel(false);
    Self { busy, interrupt_tx }
  }
}

#[derive(Debug)]
struct PoolState {
  capacity: usize,
  slots: BTreeMap<usize, SlotEntry>,
}

impl PoolState {
  fn infos(&self) -> Vec<SlotInfo> {
    self
      .slots
      .iter()
      .map(|(index, entry)| SlotInfo {
        index: *index,
        idle: !entry.busy,
      })
      .collect()
  }

  fn lowest_free_index(&self) -> usize {
    let mut index = 0;
    while self.slots.contains_key(&index) {
      index += 1;
    }
    index
  }

  /// Creates idle slots at the lowest free indices until the pool is back at
  /// capacity.
  fn replenish(&mut self) -> Vec<usize> {
    let mut created = Vec::new();
    while self.slots.len() < self.capacity {
      let index = self.lowest_free_index();
      self.slots.insert(index, SlotEntry::new(false));
      created.push(index);
    }
    created
  }
}

/// Exclusive access to a pool's slots, handed out by [`SlotPool::with_lock`].
pub struct LockedPool<'a> {
  owner: &'a str,
  state: &'a mut PoolState,
}

impl LockedPool<'_> {
  pub fn slots(&self) -> Vec<SlotInfo> {
    self.state.infos()
  }

  pub fn current_slot_count(&self) -> usize {
    self.state.slots.len()
  }

  pub fn capacity(&self) -> usize {
    self.state.capacity
  }

  pub fn set_capacity(&mut self, capacity: usize) {
    self.state.capacity = capacity;
  }

  /// Signals and retires an idle slot. Returns `false` for a busy or unknown
  /// slot.
  pub fn interrupt(&mut self, index: usize) -> bool {
    match self.state.slots.get(&index) {
      Some(entry) if !entry.busy => {}
      _ => return false,
    }
    if let Some(entry) = self.state.slots.remove(&index) {
      entry.interrupt_tx.send_replace(true);
      debug!(pool = %self.owner, slot = index, "Interrupted idle slot.");
      true
    } else {
      false
    }
  }

  /// Creates an idle slot at `index`. Returns `false` if it is taken.
  pub fn create(&mut self, index: usize) -> bool {
    if self.state.slots.contains_key(&index) {
      return false;
    }
    self.state.slots.insert(index, SlotEntry::new(false));
    debug!(pool = %self.owner, slot = index, "Created slot.");
    true
  }

  pub fn replenish(&mut self) -> Vec<usize> {
    let created = self.state.replenish();
    if !created.is_empty() {
      debug!(pool = %self.owner, slots = ?created, "Replenished slots.");
    }
    created
  }
}

/// The live worker slots of one target.
#[derive(Debug)]
pub struct SlotPool {
  owner: String,
  inner: Mutex<PoolState>,
}

impl SlotPool {
  /// Creates a pool with idle slots `0..capacity`.
  pub fn new(owner: impl Into<String>, capacity: usize) -> Self {
    let slots = (0..capacity).map(|i| (i, SlotEntry::new(false))).collect();
    Self {
      owner: owner.into(),
      inner: Mutex::new(PoolState { capacity, slots }),
    }
  }

  /// Creates a pool with an explicit slot layout. Busy slots are held by
  /// whoever the caller says; return them with [`release`](Self::release).
  pub fn from_slots(
    owner: impl Into<String>,
    capacity: usize,
    slots: impl IntoIterator<Item = SlotInfo>,
  ) -> Self {
    let slots = slots
      .into_iter()
      .map(|s| (s.index, SlotEntry::new(!s.idle)))
      .collect();
    Self {
      owner: owner.into(),
      inner: Mutex::new(PoolState { capacity, slots }),
    }
  }

  pub fn owner(&self) -> &str {
    &self.owner
  }

  pub fn current_slot_count(&self) -> usize {
    self.inner.lock().slots.len()
  }

  /// The requested slot count the pool converges towards.
  pub fn capacity(&self) -> usize {
    self.inner.lock().capacity
  }

  /// Slots in index order.
  pub fn slots(&self) -> Vec<SlotInfo> {
    self.inner.lock().infos()
  }

  pub fn idle_count(&self) -> usize {
    self.inner.lock().slots.values().filter(|e| !e.busy).count()
  }

  /// Runs `f` while holding the pool's assignment lock.
  pub fn with_lock<R>(&self, f: impl FnOnce(&mut LockedPool<'_>) -> R) -> R {
    let mut state = self.inner.lock();
    let mut locked = LockedPool {
      owner: self.owner.as_str(),
      state: &mut *state,
    };
    f(&mut locked)
  }

  /// Hands the lowest idle slot out for work.
  pub fn acquire(self: &Arc<Self>) -> Option<SlotLease> {
    let mut state = self.inner.lock();
    let (index, entry) = state.slots.iter_mut().find(|(_, e)| !e.busy)?;
    entry.busy = true;
    let index = *index;
    trace!(pool = %self.owner, slot = index, "Slot acquired.");
    Some(SlotLease {
      pool: Arc::clone(self),
      index,
    })
  }

  /// Returns a busy slot to the pool. A slot released while the pool holds
  /// more slots than its capacity retires instead of going idle.
  pub fn release(&self, index: usize) {
    let mut state = self.inner.lock();
    let over_capacity = state.slots.len() > state.capacity;
    let Some(entry) = state.slots.get_mut(&index) else {
      trace!(pool = %self.owner, slot = index, "Release of unknown slot ignored.");
      return;
    };
    if !entry.busy {
      return;
    }
    if over_capacity {
      state.slots.remove(&index);
      debug!(pool = %self.owner, slot = index, "Slot retired on release.");
    } else {
      entry.busy = false;
      trace!(pool = %self.owner, slot = index, "Slot released.");
    }
  }

  /// A receiver that flips to `true` when the slot at `index` is
  /// interrupted. `None` if there is no such slot.
  pub fn interrupt_signal(&self, index: usize) -> Option<watch::Receiver<bool>> {
    self
      .inner
      .lock()
      .slots
      .get(&index)
      .map(|e| e.interrupt_tx.subscribe())
  }
}

/// A slot handed out by [`SlotPool::acquire`]. Dropping the lease releases
/// the slot.
#[derive(Debug)]
pub struct SlotLease {
  pool: Arc<SlotPool>,
  index: usize,
}

impl SlotLease {
  pub fn index(&self) -> usize {
    self.index
  }

  pub fn pool(&self) -> &Arc<SlotPool> {
    &self.pool
  }
}

impl Drop for SlotLease {
  fn drop(&mut self) {
    self.pool.release(self.index);
  }
}

/// Resizes `pool` to `requested` slots under the pool lock.
///
/// The requested count becomes the pool's capacity, idle slots are
/// interrupted on a shrink, and the lowest free indices are filled on a
/// grow. The call never waits for busy slots to drain.
pub fn resize(pool: &SlotPool, requested: usize) -> ResizeOutcome {
  pool.with_lock(|locked| {
    let previous = locked.current_slot_count();
    locked.set_capacity(requested);
    let plan = plan_resize(&locked.slots(), requested);

    let mut interrupted = Vec::with_capacity(plan.interrupt.len());
    for index in plan.interrupt {
      if locked.interrupt(index) {
        interrupted.push(index);
      }
    }
    let mut created = Vec::with_capacity(plan.create.len());
    for index in plan.create {
      if locked.create(index) {
        created.push(index);
      }
    }
    // an interrupted idle slot leaves the pool at once, so a shrink can
    // dip below the requested count
    created.extend(locked.replenish());
    created.sort_unstable();

    let outcome = ResizeOutcome {
      previous,
      requested,
      interrupted,
      created,
      current: locked.current_slot_count(),
    };
    debug!(pool = %pool.owner(), previous, requested, current = outcome.current, interrupted = ?outcome.interrupted, created = ?outcome.created, "Pool resized.");
    outcome
  })
}
