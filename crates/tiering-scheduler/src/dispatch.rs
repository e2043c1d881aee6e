//! Action dispatch — runs one queue item through the executor and records
//! the outcome.
//!
//! Every attempt leaves exactly one execution log entry and moves the item
//! out of PENDING. An executor or routing error is logged as `ERROR`, the
//! item is marked FAILED, and the error is handed back to the batch loop.

use std::sync::Arc;

use chrono::NaiveDateTime;
use tiering_core::{Result, TieringError};

use crate::audit::ExecutionLog;
use crate::clock::Clock;
use crate::executor::ActionExecutor;
use crate::model::{
    ActionResult, ActionStatus, ExecutionLogEntry, Policy, QueueItem, QueueStatus, TieringAction,
    space_metrics,
};
use crate::persistence::{TieringDb, elapsed_seconds};

pub struct ActionDispatcher {
    db: Arc<TieringDb>,
    log: Arc<ExecutionLog>,
    executor: Arc<dyn ActionExecutor>,
    clock: Arc<dyn Clock>,
}

impl ActionDispatcher {
    pub fn new(
        db: Arc<TieringDb>,
        log: Arc<ExecutionLog>,
        executor: Arc<dyn ActionExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { db, log, executor, clock }
    }

    /// Dispatch one queue item. Returns the reported status, or the error
    /// that aborted the attempt (already logged and recorded).
    pub async fn dispatch(&self, queue_id: i64) -> Result<ActionStatus> {
        let item = self
            .db
            .get_queue_item(queue_id)?
            .ok_or(TieringError::QueueItemNotFound(queue_id))?;
        let started = self.clock.now();

        let Some(policy) = self.db.get_policy(item.policy_id)? else {
            let err = TieringError::PolicyNotFound(item.policy_id);
            self.record_failure(&item, None, started, &err);
            return Err(err);
        };

        let outcome = self.route(&policy, &item).await;
        let ended = self.clock.now();

        match outcome {
            Ok(result) => {
                let entry = self.entry(&item, Some(&policy), started, ended, Some(&result));
                self.log.append(&entry)?;
                self.db.set_queue_status(item.queue_id, result.status.queue_status())?;
                match result.status {
                    ActionStatus::Error => tracing::warn!(
                        "❌ {} {} → ERROR: {}",
                        entry.action_type,
                        item.target(),
                        result.error_message.as_deref().unwrap_or("no detail")
                    ),
                    status => tracing::info!(
                        "✅ {} {} → {} ({:.1}s)",
                        entry.action_type,
                        item.target(),
                        status.as_str(),
                        entry.duration_seconds
                    ),
                }
                Ok(result.status)
            }
            Err(err) => {
                self.record_failure(&item, Some(&policy), started, &err);
                Err(err)
            }
        }
    }

    async fn route(&self, policy: &Policy, item: &QueueItem) -> Result<ActionResult> {
        let action = policy.action()?;
        let target = item.target();
        let executor = &self.executor;
        match &action {
            TieringAction::Compress { compression } => {
                executor.compress_partition(&target, compression).await
            }
            TieringAction::Move { target_location, compression } => {
                executor
                    .move_partition(&target, target_location, compression.as_deref())
                    .await
            }
            TieringAction::ReadOnly => executor.make_read_only(&target).await,
            TieringAction::Drop => executor.drop_partition(&target).await,
            TieringAction::Truncate => executor.truncate_partition(&target).await,
            TieringAction::Merge => executor.merge_partitions(&target).await,
        }
    }

    /// Best effort: log the error and fail the item. The original error is
    /// what the caller sees, so secondary failures are only traced.
    fn record_failure(
        &self,
        item: &QueueItem,
        policy: Option<&Policy>,
        started: NaiveDateTime,
        err: &TieringError,
    ) {
        let ended = self.clock.now();
        let mut entry = self.entry(item, policy, started, ended, None);
        entry.error_message = Some(err.to_string());
        tracing::warn!("❌ {} {} failed: {err}", entry.action_type, item.target());

        if let Err(e) = self.log.append(&entry) {
            tracing::error!("Failed to write execution log for queue item {}: {e}", item.queue_id);
        }
        if let Err(e) = self.db.set_queue_status(item.queue_id, QueueStatus::Failed) {
            tracing::error!("Failed to mark queue item {} FAILED: {e}", item.queue_id);
        }
    }

    fn entry(
        &self,
        item: &QueueItem,
        policy: Option<&Policy>,
        started: NaiveDateTime,
        ended: NaiveDateTime,
        result: Option<&ActionResult>,
    ) -> ExecutionLogEntry {
        let action_type = policy
            .map(|p| match p.action() {
                Ok(action) => action.kind().to_string(),
                Err(_) => p.action_type.trim().to_uppercase(),
            })
            .unwrap_or_else(|| "UNKNOWN".to_string());
        let (size_before_mb, size_after_mb) = result
            .map(|r| (r.size_before_mb, r.size_after_mb))
            .unwrap_or((None, None));
        let (space_saved_mb, compression_ratio) = space_metrics(size_before_mb, size_after_mb);

        ExecutionLogEntry {
            log_id: 0,
            batch_id: item.batch_id.clone(),
            queue_id: item.queue_id,
            policy_id: policy.map(|p| p.policy_id),
            table_owner: item.table_owner.clone(),
            table_name: item.table_name.clone(),
            partition_name: item.partition_name.clone(),
            action_type,
            operation: result.map(|r| r.operation.clone()),
            start_time: started,
            end_time: ended,
            duration_seconds: elapsed_seconds(started, ended),
            size_before_mb,
            size_after_mb,
            space_saved_mb,
            compression_ratio,
            status: result.map(|r| r.status).unwrap_or(ActionStatus::Error),
            error_message: result.and_then(|r| r.error_message.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::executor::DryRunExecutor;
    use crate::model::PartitionTarget;
    use async_trait::async_trait;
    use chrono::NaiveDate;

    /// Compress succeeds with sizes, drop reports ERROR, truncate raises.
    struct ScriptedExecutor;

    #[async_trait]
    impl ActionExecutor for ScriptedExecutor {
        async fn compress_partition(&self, t: &PartitionTarget, c: &str) -> Result<ActionResult> {
            Ok(ActionResult::success(format!("COMPRESS {t} {c}")).with_sizes(200.0, 50.0))
        }
        async fn move_partition(&self, t: &PartitionTarget, loc: &str, _c: Option<&str>) -> Result<ActionResult> {
            Ok(ActionResult::success(format!("MOVE {t} {loc}")))
        }
        async fn make_read_only(&self, t: &PartitionTarget) -> Result<ActionResult> {
            let mut r = ActionResult::success(format!("READ ONLY {t}"));
            r.status = ActionStatus::Warning;
            Ok(r)
        }
        async fn drop_partition(&self, t: &PartitionTarget) -> Result<ActionResult> {
            let mut r = ActionResult::success(format!("DROP {t}"));
            r.status = ActionStatus::Error;
            r.error_message = Some("partition is referenced".into());
            Ok(r)
        }
        async fn truncate_partition(&self, _t: &PartitionTarget) -> Result<ActionResult> {
            Err(TieringError::Action("lost connection".into()))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<TieringDb>,
        log: Arc<ExecutionLog>,
        dispatcher: ActionDispatcher,
    }

    fn fixture(executor: Arc<dyn ActionExecutor>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiering.db");
        let db = Arc::new(TieringDb::open(&path).unwrap());
        let log = Arc::new(ExecutionLog::open(&path).unwrap());
        let start = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap().and_hms_opt(2, 5, 0).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start));
        let dispatcher = ActionDispatcher::new(db.clone(), log.clone(), executor, clock);
        Fixture { _dir: dir, db, log, dispatcher }
    }

    fn enqueue(f: &Fixture, policy: Policy) -> i64 {
        f.db.save_policy(&policy).unwrap();
        f.db
            .enqueue(
                policy.policy_id,
                &PartitionTarget {
                    owner: "SALES".into(),
                    table: "ORDERS".into(),
                    partition: format!("P_{}", policy.policy_id),
                },
            )
            .unwrap()
    }

    fn status_of(f: &Fixture, id: i64) -> QueueStatus {
        f.db.get_queue_item(id).unwrap().unwrap().execution_status
    }

    #[tokio::test]
    async fn test_success_logs_metrics_and_completes() {
        let f = fixture(Arc::new(ScriptedExecutor));
        let id = enqueue(&f, Policy::new(1, "compress", "COMPRESS", 100));

        assert_eq!(f.dispatcher.dispatch(id).await.unwrap(), ActionStatus::Success);
        assert_eq!(status_of(&f, id), QueueStatus::Completed);

        let entries = f.log.entries_for_queue_item(id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action_type, "COMPRESS");
        assert_eq!(entries[0].space_saved_mb, Some(150.0));
        assert_eq!(entries[0].compression_ratio, Some(4.0));
    }

    #[tokio::test]
    async fn test_warning_completes_and_error_status_fails() {
        let f = fixture(Arc::new(ScriptedExecutor));
        let ro = enqueue(&f, Policy::new(1, "ro", "READ_ONLY", 100));
        let drop = enqueue(&f, Policy::new(2, "drop", "DROP", 100));

        assert_eq!(f.dispatcher.dispatch(ro).await.unwrap(), ActionStatus::Warning);
        assert_eq!(status_of(&f, ro), QueueStatus::Completed);

        assert_eq!(f.dispatcher.dispatch(drop).await.unwrap(), ActionStatus::Error);
        assert_eq!(status_of(&f, drop), QueueStatus::Failed);
        let entry = &f.log.entries_for_queue_item(drop).unwrap()[0];
        assert_eq!(entry.error_message.as_deref(), Some("partition is referenced"));
    }

    #[tokio::test]
    async fn test_executor_error_is_logged_failed_and_reraised() {
        let f = fixture(Arc::new(ScriptedExecutor));
        let id = enqueue(&f, Policy::new(1, "truncate", "TRUNCATE", 100));

        let err = f.dispatcher.dispatch(id).await.unwrap_err();
        assert!(matches!(err, TieringError::Action(_)));
        assert_eq!(status_of(&f, id), QueueStatus::Failed);

        let entries = f.log.entries_for_queue_item(id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, ActionStatus::Error);
        assert!(entries[0].error_message.as_deref().unwrap().contains("lost connection"));
    }

    #[tokio::test]
    async fn test_merge_surfaces_not_implemented() {
        let f = fixture(Arc::new(DryRunExecutor));
        let id = enqueue(&f, Policy::new(1, "merge", "MERGE", 100));

        let err = f.dispatcher.dispatch(id).await.unwrap_err();
        assert!(matches!(err, TieringError::NotImplemented(_)));
        assert_eq!(status_of(&f, id), QueueStatus::Failed);
        assert_eq!(f.log.entries_for_queue_item(id).unwrap()[0].status, ActionStatus::Error);
    }

    #[tokio::test]
    async fn test_unknown_action_tag_fails_item() {
        let f = fixture(Arc::new(DryRunExecutor));
        let id = enqueue(&f, Policy::new(1, "odd", "shrink ", 100));

        assert!(matches!(
            f.dispatcher.dispatch(id).await,
            Err(TieringError::UnknownAction(_))
        ));
        assert_eq!(status_of(&f, id), QueueStatus::Failed);
        assert_eq!(f.log.entries_for_queue_item(id).unwrap()[0].action_type, "SHRINK");
    }

    #[tokio::test]
    async fn test_log_records_canonical_action_kind() {
        let f = fixture(Arc::new(ScriptedExecutor));
        let mut relocate = Policy::new(1, "relocate", " move", 100);
        relocate.target_location = Some("COLD_TS".into());
        let id = enqueue(&f, relocate);

        assert_eq!(f.dispatcher.dispatch(id).await.unwrap(), ActionStatus::Success);
        let entry = &f.log.entries_for_queue_item(id).unwrap()[0];
        assert_eq!(entry.action_type, "MOVE");
        assert_eq!(entry.operation.as_deref(), Some("MOVE SALES.ORDERS:P_1 COLD_TS"));
    }

    #[tokio::test]
    async fn test_missing_item_and_missing_policy() {
        let f = fixture(Arc::new(DryRunExecutor));
        assert!(matches!(
            f.dispatcher.dispatch(999).await,
            Err(TieringError::QueueItemNotFound(999))
        ));

        let orphan = f
            .db
            .enqueue(
                42,
                &PartitionTarget { owner: "X".into(), table: "T".into(), partition: "P".into() },
            )
            .unwrap();
        assert!(matches!(
            f.dispatcher.dispatch(orphan).await,
            Err(TieringError::PolicyNotFound(42))
        ));
        assert_eq!(status_of(&f, orphan), QueueStatus::Failed);
        let entries = f.log.entries_for_queue_item(orphan).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action_type, "UNKNOWN");
    }
}
