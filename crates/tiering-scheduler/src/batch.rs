//! Batch runner — one bounded pass over the work queue.
//!
//! Items are taken in (policy priority, queue id) order, tagged with the
//! batch id and a 1-based sequence just before dispatch, and dispatched one
//! at a time. A failing item never aborts the batch. The window is checked
//! between items, never during a dispatch.

use std::sync::Arc;

use serde::Serialize;
use tiering_core::Result;

use crate::checkpoint::Checkpointer;
use crate::clock::Clock;
use crate::dispatch::ActionDispatcher;
use crate::model::QueueStatus;
use crate::persistence::TieringDb;
use crate::schedule::{ScheduleConfig, in_window};

/// What one batch did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub selected: u32,
    pub dispatched: u32,
    pub completed: u32,
    pub failed: u32,
    pub checkpoints: u32,
    pub last_queue_id: Option<i64>,
    /// The window closed before every selected item was dispatched.
    pub stopped_by_window: bool,
}

pub struct BatchRunner {
    db: Arc<TieringDb>,
    dispatcher: ActionDispatcher,
    checkpointer: Checkpointer,
    clock: Arc<dyn Clock>,
}

impl BatchRunner {
    pub fn new(
        db: Arc<TieringDb>,
        dispatcher: ActionDispatcher,
        checkpointer: Checkpointer,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { db, dispatcher, checkpointer, clock }
    }

    pub fn checkpointer(&self) -> &Checkpointer {
        &self.checkpointer
    }

    /// Run one batch of at most `max_operations` items.
    /// `respect_window` is false for forced runs.
    ///
    /// With checkpointing enabled, a checkpoint follows every
    /// `checkpoint_frequency`-th dispatched item and one final checkpoint
    /// closes the batch. A batch that dispatched nothing has no last item to
    /// record and writes no checkpoint at all.
    pub async fn run_batch(
        &self,
        batch_id: &str,
        schedule: &ScheduleConfig,
        max_operations: u32,
        respect_window: bool,
    ) -> Result<BatchOutcome> {
        let items = self.db.select_batch_items(max_operations)?;
        let checkpoint_every = schedule.checkpoint_every();
        let mut outcome = BatchOutcome {
            selected: items.len() as u32,
            ..BatchOutcome::default()
        };

        for item in &items {
            if respect_window && !in_window(schedule, self.clock.now()) {
                tracing::info!(
                    "🌙 Window closed inside batch {batch_id}; stopping after {} of {} items",
                    outcome.dispatched,
                    outcome.selected
                );
                outcome.stopped_by_window = true;
                break;
            }

            let sequence = outcome.dispatched + 1;
            if !self.db.tag_queue_item(item.queue_id, batch_id, sequence)? {
                tracing::debug!("Queue item {} already claimed, skipping", item.queue_id);
                continue;
            }

            match self.dispatcher.dispatch(item.queue_id).await {
                Ok(status) if status.queue_status() == QueueStatus::Completed => {
                    outcome.completed += 1
                }
                Ok(_) => outcome.failed += 1,
                Err(e) => {
                    tracing::warn!("⚠️ Batch {batch_id}: item {} failed: {e}", item.queue_id);
                    outcome.failed += 1;
                }
            }
            outcome.dispatched += 1;
            outcome.last_queue_id = Some(item.queue_id);

            if schedule.enable_checkpointing && outcome.dispatched as usize % checkpoint_every == 0 {
                self.checkpointer.checkpoint(batch_id, item.queue_id, outcome.completed)?;
                outcome.checkpoints += 1;
            }
        }

        if schedule.enable_checkpointing {
            if let Some(last) = outcome.last_queue_id {
                self.checkpointer.checkpoint(batch_id, last, outcome.completed)?;
                outcome.checkpoints += 1;
            }
        }

        Ok(outcome)
    }
}
