//! # Tiering Scheduler
//!
//! Windowed, batched execution of partition tiering actions.
//! Work items come from a persistent queue; each is dispatched to an
//! action executor and logged, in bounded batches that only run inside a
//! schedule's weekly execution window.
//!
//! ## Architecture
//! ```text
//! spawn_trigger (tokio interval)
//!   └── ConcurrencyGuard::should_execute_now
//!         ├── RUNNING batch?   → skip
//!         ├── no pending work? → skip
//!         └── window closed?   → skip
//!
//! ExecutionOrchestrator::execute
//!   └── loop while window open && work pending
//!        └── BatchRunner::run_batch
//!              ├── tag item (batch id, sequence)
//!              ├── ActionDispatcher::dispatch → ActionExecutor
//!              │     └── ExecutionLog (one entry per attempt)
//!              └── Checkpointer every N items
//! ```
//!
//! State lives in SQLite (`TieringDb`); the execution log uses its own
//! connection so entries survive whatever happens to the batch.

pub mod audit;
pub mod batch;
pub mod checkpoint;
pub mod clock;
pub mod dispatch;
pub mod engine;
pub mod executor;
pub mod guard;
pub mod model;
pub mod persistence;
pub mod schedule;

pub use audit::ExecutionLog;
pub use batch::{BatchOutcome, BatchRunner};
pub use checkpoint::{CheckpointInfo, Checkpointer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::ActionDispatcher;
pub use engine::{BatchSummary, ExecutionOrchestrator, ExecutionReport, ExitReason, spawn_trigger};
pub use executor::{ActionExecutor, DryRunExecutor};
pub use guard::{ConcurrencyGuard, GateDecision};
pub use model::{
    ActionResult, ActionStatus, BatchStatus, ExecutionLogEntry, ExecutionState, PartitionTarget,
    Policy, QueueItem, QueueStatus, TieringAction,
};
pub use persistence::TieringDb;
pub use schedule::{ScheduleConfig, TimeWindow, WeeklyWindows, in_window};
