//! Domain model — queue items, policies, batch state and audit records.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tiering_core::{Result, TieringError};

/// Compression kind used when a COMPRESS policy does not name one.
pub const DEFAULT_COMPRESSION: &str = "BASIC";

/// Lifecycle of a queue item as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Pending,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "PENDING",
            QueueStatus::Completed => "COMPLETED",
            QueueStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "COMPLETED" => QueueStatus::Completed,
            "FAILED" => QueueStatus::Failed,
            _ => QueueStatus::Pending,
        }
    }
}

/// The partition an action is aimed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTarget {
    pub owner: String,
    pub table: String,
    pub partition: String,
}

impl std::fmt::Display for PartitionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}:{}", self.owner, self.table, self.partition)
    }
}

/// One unit of pending work, produced by the policy evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub queue_id: i64,
    pub policy_id: i64,
    pub table_owner: String,
    pub table_name: String,
    pub partition_name: String,
    /// Set by the evaluator; never written by the engine.
    pub eligible: bool,
    pub execution_status: QueueStatus,
    pub batch_id: Option<String>,
    /// 1-based position within `batch_id`.
    pub execution_sequence: Option<u32>,
}

impl QueueItem {
    pub fn target(&self) -> PartitionTarget {
        PartitionTarget {
            owner: self.table_owner.clone(),
            table: self.table_name.clone(),
            partition: self.partition_name.clone(),
        }
    }
}

/// A tiering policy (read-only to the engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub policy_id: i64,
    pub policy_name: String,
    /// COMPRESS, MOVE, READ_ONLY, DROP, TRUNCATE or MERGE.
    pub action_type: String,
    pub compression_type: Option<String>,
    pub target_location: Option<String>,
    /// Lower value runs first.
    pub priority: i32,
    pub enabled: bool,
}

impl Policy {
    pub fn new(policy_id: i64, name: &str, action_type: &str, priority: i32) -> Self {
        Self {
            policy_id,
            policy_name: name.to_string(),
            action_type: action_type.to_string(),
            compression_type: None,
            target_location: None,
            priority,
            enabled: true,
        }
    }

    /// Resolve the stored action tag into a routable action.
    pub fn action(&self) -> Result<TieringAction> {
        let compression = self
            .compression_type
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        match self.action_type.trim().to_uppercase().as_str() {
            "COMPRESS" => Ok(TieringAction::Compress {
                compression: compression.unwrap_or_else(|| DEFAULT_COMPRESSION.to_string()),
            }),
            "MOVE" => {
                let target_location = self
                    .target_location
                    .clone()
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| {
                        TieringError::Config(format!(
                            "policy '{}' has a MOVE action without a target location",
                            self.policy_name
                        ))
                    })?;
                Ok(TieringAction::Move { target_location, compression })
            }
            "READ_ONLY" => Ok(TieringAction::ReadOnly),
            "DROP" => Ok(TieringAction::Drop),
            "TRUNCATE" => Ok(TieringAction::Truncate),
            "MERGE" => Ok(TieringAction::Merge),
            other => Err(TieringError::UnknownAction(other.to_string())),
        }
    }
}

/// Closed set of tiering actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TieringAction {
    Compress { compression: String },
    /// Relocate, optionally recompressing on the way.
    Move { target_location: String, compression: Option<String> },
    ReadOnly,
    Drop,
    Truncate,
    /// Merge smaller partitions into a larger one. Defined but not implemented.
    Merge,
}

impl TieringAction {
    pub fn kind(&self) -> &'static str {
        match self {
            TieringAction::Compress { .. } => "COMPRESS",
            TieringAction::Move { .. } => "MOVE",
            TieringAction::ReadOnly => "READ_ONLY",
            TieringAction::Drop => "DROP",
            TieringAction::Truncate => "TRUNCATE",
            TieringAction::Merge => "MERGE",
        }
    }
}

/// Outcome reported for a dispatched action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    Success,
    Warning,
    Error,
    Skipped,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Success => "SUCCESS",
            ActionStatus::Warning => "WARNING",
            ActionStatus::Error => "ERROR",
            ActionStatus::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "SUCCESS" => ActionStatus::Success,
            "WARNING" => ActionStatus::Warning,
            "SKIPPED" => ActionStatus::Skipped,
            _ => ActionStatus::Error,
        }
    }

    /// Queue status that follows from this outcome.
    pub fn queue_status(&self) -> QueueStatus {
        match self {
            ActionStatus::Success | ActionStatus::Warning | ActionStatus::Skipped => {
                QueueStatus::Completed
            }
            ActionStatus::Error => QueueStatus::Failed,
        }
    }
}

/// Result contract of the action executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// SQL or operation descriptor actually executed.
    pub operation: String,
    pub status: ActionStatus,
    pub error_message: Option<String>,
    pub size_before_mb: Option<f64>,
    pub size_after_mb: Option<f64>,
}

impl ActionResult {
    pub fn success(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            status: ActionStatus::Success,
            error_message: None,
            size_before_mb: None,
            size_after_mb: None,
        }
    }

    pub fn with_sizes(mut self, before_mb: f64, after_mb: f64) -> Self {
        self.size_before_mb = Some(before_mb);
        self.size_after_mb = Some(after_mb);
        self
    }
}

/// Status of a batch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "RUNNING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "RUNNING" => BatchStatus::Running,
            "COMPLETED" => BatchStatus::Completed,
            _ => BatchStatus::Failed,
        }
    }
}

/// One row per batch attempt; the RUNNING row doubles as the run lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub batch_id: String,
    pub schedule_name: String,
    pub status: BatchStatus,
    pub start_time: NaiveDateTime,
    pub end_time: Option<NaiveDateTime>,
    pub elapsed_seconds: f64,
    pub total_operations: u32,
    pub completed_operations: u32,
    pub failed_operations: u32,
    pub last_checkpoint: Option<NaiveDateTime>,
    pub last_queue_id: Option<i64>,
    pub checkpoint_completed: u32,
}

/// Immutable audit record of one dispatched action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub log_id: i64,
    pub batch_id: Option<String>,
    pub queue_id: i64,
    pub policy_id: Option<i64>,
    pub table_owner: String,
    pub table_name: String,
    pub partition_name: String,
    pub action_type: String,
    pub operation: Option<String>,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub duration_seconds: f64,
    pub size_before_mb: Option<f64>,
    pub size_after_mb: Option<f64>,
    pub space_saved_mb: Option<f64>,
    pub compression_ratio: Option<f64>,
    pub status: ActionStatus,
    pub error_message: Option<String>,
}

/// Derived space metrics: (space saved, compression ratio).
pub fn space_metrics(before_mb: Option<f64>, after_mb: Option<f64>) -> (Option<f64>, Option<f64>) {
    match (before_mb, after_mb) {
        (Some(before), Some(after)) => {
            let ratio = (after > 0.0).then(|| before / after);
            (Some(before - after), ratio)
        }
        _ => (None, None),
    }
}
