//! Batch checkpoints for crash recovery.

use std::sync::Arc;

use chrono::NaiveDateTime;
use tiering_core::{Result, TieringError};

use crate::clock::Clock;
use crate::persistence::TieringDb;

/// Progress recorded by the last checkpoint of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    pub batch_id: String,
    pub at: NaiveDateTime,
    pub last_queue_id: i64,
    pub completed: u32,
}

pub struct Checkpointer {
    db: Arc<TieringDb>,
    clock: Arc<dyn Clock>,
}

impl Checkpointer {
    pub fn new(db: Arc<TieringDb>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Persist progress. Repeating a call with the same arguments only moves
    /// the checkpoint timestamp (and elapsed time) forward.
    pub fn checkpoint(&self, batch_id: &str, last_queue_id: i64, completed: u32) -> Result<()> {
        let now = self.clock.now();
        self.db.record_checkpoint(batch_id, now, last_queue_id, completed)?;
        tracing::debug!("💾 Checkpoint {batch_id}: last item {last_queue_id}, {completed} completed");
        Ok(())
    }

    /// The last checkpoint of a batch, if one was ever written.
    pub fn last_checkpoint(&self, batch_id: &str) -> Result<Option<CheckpointInfo>> {
        let state = self
            .db
            .get_execution_state(batch_id)?
            .ok_or_else(|| TieringError::BatchNotFound(batch_id.to_string()))?;
        Ok(match (state.last_checkpoint, state.last_queue_id) {
            (Some(at), Some(last_queue_id)) => Some(CheckpointInfo {
                batch_id: state.batch_id,
                at,
                last_queue_id,
                completed: state.checkpoint_completed,
            }),
            _ => None,
        })
    }
}
