//! Action executor interface — the storage-mutation side of the engine.
//!
//! The engine treats each call as opaque: it hands over a partition and the
//! policy's parameters and gets back an [`ActionResult`]. An `Err` means the
//! call itself blew up; it is logged as an `ERROR` outcome by the dispatcher.

use async_trait::async_trait;
use tiering_core::{Result, TieringError};

use crate::model::{ActionResult, ActionStatus, PartitionTarget, TieringAction};

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn compress_partition(
        &self,
        target: &PartitionTarget,
        compression: &str,
    ) -> Result<ActionResult>;

    /// Relocate a partition, optionally recompressing it.
    async fn move_partition(
        &self,
        target: &PartitionTarget,
        target_location: &str,
        compression: Option<&str>,
    ) -> Result<ActionResult>;

    async fn make_read_only(&self, target: &PartitionTarget) -> Result<ActionResult>;

    async fn drop_partition(&self, target: &PartitionTarget) -> Result<ActionResult>;

    async fn truncate_partition(&self, target: &PartitionTarget) -> Result<ActionResult>;

    /// Merge smaller partitions into a larger one.
    async fn merge_partitions(&self, _target: &PartitionTarget) -> Result<ActionResult> {
        Err(TieringError::NotImplemented("MERGE partitions".into()))
    }
}

/// Human-readable operation descriptor for an action.
pub fn describe(action: &TieringAction, target: &PartitionTarget) -> String {
    let table = format!("{}.{}", target.owner, target.table);
    let partition = &target.partition;
    match action {
        TieringAction::Compress { compression } => {
            format!("ALTER TABLE {table} MOVE PARTITION {partition} COMPRESS {compression}")
        }
        TieringAction::Move { target_location, compression } => match compression {
            Some(c) => format!(
                "ALTER TABLE {table} MOVE PARTITION {partition} TABLESPACE {target_location} COMPRESS {c}"
            ),
            None => format!("ALTER TABLE {table} MOVE PARTITION {partition} TABLESPACE {target_location}"),
        },
        TieringAction::ReadOnly => format!("ALTER TABLE {table} MODIFY PARTITION {partition} READ ONLY"),
        TieringAction::Drop => format!("ALTER TABLE {table} DROP PARTITION {partition}"),
        TieringAction::Truncate => format!("ALTER TABLE {table} TRUNCATE PARTITION {partition}"),
        TieringAction::Merge => format!("ALTER TABLE {table} MERGE PARTITIONS INTO {partition}"),
    }
}

/// Reports what it would run without touching storage. Every action comes
/// back `SKIPPED`, which completes the queue item.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunExecutor;

impl DryRunExecutor {
    fn skipped(action: &TieringAction, target: &PartitionTarget) -> Result<ActionResult> {
        let operation = describe(action, target);
        tracing::info!("📝 [dry-run] {operation}");
        Ok(ActionResult {
            operation,
            status: ActionStatus::Skipped,
            error_message: None,
            size_before_mb: None,
            size_after_mb: None,
        })
    }
}

#[async_trait]
impl ActionExecutor for DryRunExecutor {
    async fn compress_partition(
        &self,
        target: &PartitionTarget,
        compression: &str,
    ) -> Result<ActionResult> {
        Self::skipped(&TieringAction::Compress { compression: compression.to_string() }, target)
    }

    async fn move_partition(
        &self,
        target: &PartitionTarget,
        target_location: &str,
        compression: Option<&str>,
    ) -> Result<ActionResult> {
        let action = TieringAction::Move {
            target_location: target_location.to_string(),
            compression: compression.map(str::to_string),
        };
        Self::skipped(&action, target)
    }

    async fn make_read_only(&self, target: &PartitionTarget) -> Result<ActionResult> {
        Self::skipped(&TieringAction::ReadOnly, target)
    }

    async fn drop_partition(&self, target: &PartitionTarget) -> Result<ActionResult> {
        Self::skipped(&TieringAction::Drop, target)
    }

    async fn truncate_partition(&self, target: &PartitionTarget) -> Result<ActionResult> {
        Self::skipped(&TieringAction::Truncate, target)
    }
}
