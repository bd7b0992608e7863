//! LabelKeeper: Cron-Driven Label and Capacity Mutation for Build Nodes
//!
//! Runs a fixed-period tick that evaluates user-defined cron schedules, picks
//! the one that is due, and rewrites the labels (and optionally the worker
//! capacity) of the targets it names, all while a system-wide maintenance
//! flag is held and afterwards restored to its previous value.
//!
//! # Features
//!
//! - Five-field cron expressions with the `H` hash token and `@daily`-style
//!   aliases; `H` resolves from the schedule name so it is stable per
//!   schedule.
//! - Due selection with a one-period eligibility window and a positional
//!   tie-break (configuration order wins).
//! - `ADD`, `REMOVE` and `REPLACE` label algebra.
//! - Soft capacity resizing of live slot pools: idle slots are interrupted,
//!   busy ones drain on their own, growth fills the lowest free indices.
//! - Single-flight ticks: a tick that finds the previous one running is
//!   dropped, not queued.
//! - Scoped maintenance windows that restore the flag on every exit path,
//!   including panics and cancellation.
//! - Per-target outcomes as values (`TickReport`, `ScheduleReport`); only
//!   the administrative `run_now` path returns errors.
//! - Built-in metrics (`MetricsSnapshot`).
//! - Optional task-local `TickContext` for targets (requires `tick_context`,
//!   on by default).
//! - Optional Serde support for the data model (requires `serde`).
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use labelkeeper::{
//!     LabelAction, LabelScheduler, MemoryNode, NodeRegistry, QuietMode, Schedule,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // tracing_subscriber::fmt().with_env_filter("warn,labelkeeper=info").init();
//!
//!     let registry = Arc::new(NodeRegistry::with_controller_labels("built-in"));
//!     registry.insert(Arc::new(MemoryNode::new("agent-1", "linux day").with_slots(2)));
//!
//!     // Every weekday evening, swap `day` for `night` and shrink to one slot.
//!     let night = Schedule::new(
//!         "evening",
//!         "0 19 * * 1-5",
//!         LabelAction::Replace,
//!         "linux night",
//!         "agent-1",
//!     )
//!     .with_target_capacity("agent-1", 1);
//!
//!     let scheduler = LabelScheduler::builder()
//!         .resolver(registry.clone())
//!         .maintenance_flag(Arc::new(QuietMode::default()))
//!         .schedules([night.clone()])
//!         .build()?;
//!
//!     // Apply it right away, outside the cron.
//!     if let Err(e) = scheduler.run_now(&night).await {
//!         eprintln!("run-now failed: {e}");
//!     }
//!
//!     tokio::time::sleep(Duration::from_secs(180)).await;
//!     println!("{:?}", scheduler.metrics_snapshot());
//!
//!     scheduler.shutdown(Some(Duration::from_secs(10))).await?;
//!     Ok(())
//! }
//! ```

// This empty module attaches the documentation block below only when
// the `tick_context` feature is enabled during doc generation.
#[cfg(all(doc, feature = "tick_context"))]
pub mod tick_context_docs {
    //! # Accessing Tick Context (`tick_context` feature)
    //!
    //! While the engine mutates a target, the target's own code (for example
    //! its `persist` implementation) can find out which tick and schedule
    //! caused the change:
    //!
    //! 1.  **`try_current_tick_context() -> Option<TickContext>`**: returns
    //!     `None` outside an engine-driven mutation.
    //! 2.  **`tick_context!() -> TickContext`**: **panics** outside an
    //!     engine-driven mutation.
    //!
    //! ```no_run
    //! use labelkeeper::try_current_tick_context;
    //!
    //! if let Some(ctx) = try_current_tick_context() {
    //!     println!("saving for schedule {} (tick {})", ctx.schedule, ctx.tick_id);
    //! }
    //! ```
}

pub mod clock;
#[cfg(feature = "tick_context")]
pub mod context;
pub mod error;
pub mod expression;
pub mod labels;
pub mod maintenance;
pub mod metrics;
pub mod pool;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod selector;
pub mod target;

// --- Public Re-exports ---

pub use scheduler::{LabelScheduler, SchedulerBuilder, DEFAULT_TICK_PERIOD};

pub use error::{
  BuildError, ExpressionError, MutationError, PersistError, RunNowError, SelectError,
  ShutdownError,
};

pub use clock::{Clock, ManualClock, SystemClock};
pub use expression::CronExpression;
pub use maintenance::{MaintenanceFlag, MaintenanceWindow, QuietMode};
pub use pool::{ResizeOutcome, SlotInfo, SlotLease, SlotPool};
pub use runner::{
  ScheduleReport, TargetChange, TargetOutcome, TickOutcome, TickReport, TickRunner, Trigger,
};
pub use schedule::{LabelAction, Schedule, ScheduleSet, TargetRef, ValidationIssue};
pub use selector::{select_due, Candidate, CronEvaluator, FireTimeEvaluator, Selection};
pub use target::{MemoryNode, NodeRegistry, Target, TargetKind, TargetResolver, MASTER_TARGET};

#[cfg(feature = "tick_context")]
pub use context::{try_current_tick_context, TickContext};

pub use metrics::MetricsSnapshot;
