use crate::runner::Trigger;

use uuid::Uuid;

/// Contextual information available to a [`Target`](crate::target::Target)
/// while the engine is mutating it, via task-locals.
/// Accessible using `try_current_tick_context()` or the `tick_context!()`
/// macro when the `tick_context` feature is enabled.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TickContext {
  /// Identifier of the tick (or run-now invocation).
  pub tick_id: Uuid,
  /// Name of the schedule being applied.
  pub schedule: String,
  pub trigger: Trigger,
}

tokio::task_local! {
    /// The `TickContext` of the mutation running on this task.
    pub static CURRENT_TICK_CONTEXT: TickContext;
}

/// Returns the current `TickContext`, or `None` outside an engine-driven
/// mutation.
pub fn try_current_tick_context() -> Option<TickContext> {
  CURRENT_TICK_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Retrieves the current `TickContext`, panicking outside an engine-driven
/// mutation. Use `try_current_tick_context()` for optional access.
///
/// # Panics
/// Panics if the `CURRENT_TICK_CONTEXT` task local has not been set.
#[macro_export]
macro_rules! tick_context {
  () => {
    $crate::context::CURRENT_TICK_CONTEXT.with(|ctx| ctx.clone())
  };
}
