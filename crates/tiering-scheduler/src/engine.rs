//! Execution orchestrator — the continuous loop that drains the queue in
//! batches while the schedule's window stays open.
//!
//! ```text
//! execute(schedule, resume?, force)
//!   ├── resolve schedule + batch size limit
//!   ├── window closed? → WindowNotOpenAtStart
//!   └── loop
//!        ├── window closed?          → WindowClosed
//!        ├── no eligible work?       → NoWork
//!        ├── mint batch id, insert RUNNING state
//!        ├── BatchRunner::run_batch  → COMPLETED | FAILED (loop continues)
//!        └── cooldown, window closed? → WindowClosedDuringCooldown
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tiering_core::{OrphanPolicy, Result, TieringError};

use crate::audit::ExecutionLog;
use crate::batch::{BatchOutcome, BatchRunner};
use crate::checkpoint::Checkpointer;
use crate::clock::Clock;
use crate::dispatch::ActionDispatcher;
use crate::executor::ActionExecutor;
use crate::guard::ConcurrencyGuard;
use crate::model::{BatchStatus, QueueStatus};
use crate::persistence::TieringDb;
use crate::schedule::{ScheduleConfig, in_window};

/// Why an `execute` call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    WindowNotOpenAtStart,
    WindowClosed,
    NoWork,
    WindowClosedDuringCooldown,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::WindowNotOpenAtStart => write!(f, "window not open at start"),
            ExitReason::WindowClosed => write!(f, "window closed"),
            ExitReason::NoWork => write!(f, "no work"),
            ExitReason::WindowClosedDuringCooldown => write!(f, "window closed during cooldown"),
        }
    }
}

/// One batch attempted during an `execute` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub status: BatchStatus,
    /// Absent when the batch failed.
    pub outcome: Option<BatchOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub schedule_name: String,
    pub exit_reason: ExitReason,
    pub batches: Vec<BatchSummary>,
}

impl ExecutionReport {
    fn new(schedule_name: &str, exit_reason: ExitReason, batches: Vec<BatchSummary>) -> Self {
        Self { schedule_name: schedule_name.to_string(), exit_reason, batches }
    }

    pub fn dispatched(&self) -> u32 {
        self.batches
            .iter()
            .filter_map(|b| b.outcome.as_ref())
            .map(|o| o.dispatched)
            .sum()
    }
}

pub struct ExecutionOrchestrator {
    db: Arc<TieringDb>,
    runner: BatchRunner,
    guard: ConcurrencyGuard,
    clock: Arc<dyn Clock>,
    orphan_policy: OrphanPolicy,
}

impl ExecutionOrchestrator {
    pub fn new(
        db: Arc<TieringDb>,
        log: Arc<ExecutionLog>,
        executor: Arc<dyn ActionExecutor>,
        clock: Arc<dyn Clock>,
        orphan_policy: OrphanPolicy,
    ) -> Self {
        let dispatcher = ActionDispatcher::new(db.clone(), log, executor, clock.clone());
        let checkpointer = Checkpointer::new(db.clone(), clock.clone());
        let runner = BatchRunner::new(db.clone(), dispatcher, checkpointer, clock.clone());
        let guard = ConcurrencyGuard::new(db.clone(), clock.clone());
        Self { db, runner, guard, clock, orphan_policy }
    }

    pub fn guard(&self) -> &ConcurrencyGuard {
        &self.guard
    }

    pub fn should_execute_now(&self, schedule_name: &str) -> Result<bool> {
        self.guard.should_execute_now(schedule_name)
    }

    /// Run batches until the window closes or the queue drains.
    /// `force_run` skips every window check; everything else still applies.
    pub async fn execute(
        &self,
        schedule_name: &str,
        resume_batch_id: Option<&str>,
        force_run: bool,
    ) -> Result<ExecutionReport> {
        match self.run(schedule_name, resume_batch_id, force_run).await {
            Ok(report) => {
                tracing::info!(
                    "🏁 '{}' finished: {} ({} batches, {} items)",
                    schedule_name,
                    report.exit_reason,
                    report.batches.len(),
                    report.dispatched()
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!("💥 '{schedule_name}' aborted: {e}");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        schedule_name: &str,
        resume_batch_id: Option<&str>,
        force_run: bool,
    ) -> Result<ExecutionReport> {
        let schedule = self.db.get_schedule(schedule_name)?;
        let batch_limit = self.db.max_partitions_per_batch()?;
        if let Some(id) = resume_batch_id {
            if !self.db.batch_exists(id)? {
                return Err(TieringError::BatchNotFound(id.to_string()));
            }
        }

        if !force_run && !self.window_open(&schedule) {
            tracing::info!("⏰ '{schedule_name}': window not open, nothing to do");
            return Ok(ExecutionReport::new(schedule_name, ExitReason::WindowNotOpenAtStart, vec![]));
        }
        if force_run {
            tracing::info!("⚡ '{schedule_name}': forced run, window checks disabled");
        }

        match resume_batch_id {
            Some(id) => self.prepare_resume(id)?,
            None => self.recover_orphans(None)?,
        }

        let mut batches = Vec::new();
        let mut sequence = 0u32;
        loop {
            if !force_run && !self.window_open(&schedule) {
                tracing::info!("🌙 '{schedule_name}': window closed, stopping");
                return Ok(ExecutionReport::new(schedule_name, ExitReason::WindowClosed, batches));
            }

            let pending = self.db.count_pending()?;
            if pending == 0 {
                tracing::info!("📭 '{schedule_name}': no eligible work left");
                return Ok(ExecutionReport::new(schedule_name, ExitReason::NoWork, batches));
            }

            sequence += 1;
            let batch_id = self.mint_batch_id(&mut sequence)?;
            let total = pending.min(batch_limit);
            self.db
                .create_execution_state(&batch_id, schedule_name, self.clock.now(), total)?;
            tracing::info!("🚀 Batch {batch_id} started: {total} of {pending} pending items");

            let summary = self.run_one(&batch_id, &schedule, batch_limit, !force_run).await?;
            let stopped_by_window = summary.outcome.as_ref().is_some_and(|o| o.stopped_by_window);
            batches.push(summary);
            if !force_run && stopped_by_window {
                tracing::info!("🌙 '{schedule_name}': window closed inside batch {batch_id}, stopping");
                return Ok(ExecutionReport::new(schedule_name, ExitReason::WindowClosed, batches));
            }

            let cooldown = schedule.cooldown();
            if !cooldown.is_zero() {
                tracing::info!("😴 Cooling down {} min before next batch", cooldown.as_secs() / 60);
                self.clock.sleep(cooldown).await;
                if !force_run && !self.window_open(&schedule) {
                    tracing::info!("🌙 '{schedule_name}': window closed during cooldown");
                    return Ok(ExecutionReport::new(
                        schedule_name,
                        ExitReason::WindowClosedDuringCooldown,
                        batches,
                    ));
                }
            }
        }
    }

    /// Run a batch and close its state row. A batch error marks the row
    /// FAILED and is contained here; only a failure to record that escapes.
    async fn run_one(
        &self,
        batch_id: &str,
        schedule: &ScheduleConfig,
        batch_limit: u32,
        respect_window: bool,
    ) -> Result<BatchSummary> {
        match self.runner.run_batch(batch_id, schedule, batch_limit, respect_window).await {
            Ok(outcome) => {
                self.db.finish_execution_state(
                    batch_id,
                    BatchStatus::Completed,
                    self.clock.now(),
                    outcome.completed,
                    outcome.failed,
                )?;
                tracing::info!(
                    "✅ Batch {batch_id} completed: {} ok, {} failed",
                    outcome.completed,
                    outcome.failed
                );
                Ok(BatchSummary {
                    batch_id: batch_id.to_string(),
                    status: BatchStatus::Completed,
                    outcome: Some(outcome),
                    error: None,
                })
            }
            Err(e) => {
                tracing::warn!("⚠️ Batch {batch_id} failed: {e}");
                let (completed, failed) = self.batch_counts(batch_id)?;
                self.db.finish_execution_state(
                    batch_id,
                    BatchStatus::Failed,
                    self.clock.now(),
                    completed,
                    failed,
                )?;
                self.recover_orphans(Some(batch_id))?;
                Ok(BatchSummary {
                    batch_id: batch_id.to_string(),
                    status: BatchStatus::Failed,
                    outcome: None,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    fn window_open(&self, schedule: &ScheduleConfig) -> bool {
        in_window(schedule, self.clock.now())
    }

    /// `BATCH_YYYYMMDD_HHMMSS_NNN`, bumping the suffix past ids already stored.
    fn mint_batch_id(&self, sequence: &mut u32) -> Result<String> {
        let stamp = self.clock.now().format("%Y%m%d_%H%M%S").to_string();
        loop {
            let id = format!("BATCH_{stamp}_{:03}", *sequence);
            if !self.db.batch_exists(&id)? {
                return Ok(id);
            }
            *sequence += 1;
        }
    }

    fn batch_counts(&self, batch_id: &str) -> Result<(u32, u32)> {
        let items = self.db.queue_items_for_batch(batch_id)?;
        let count = |status| items.iter().filter(|i| i.execution_status == status).count() as u32;
        Ok((count(QueueStatus::Completed), count(QueueStatus::Failed)))
    }

    /// Apply the orphan policy to items left tagged by batches that are not running.
    fn recover_orphans(&self, batch_id: Option<&str>) -> Result<()> {
        match self.orphan_policy {
            OrphanPolicy::Release => {
                let released = self.db.release_orphans(batch_id)?;
                if released > 0 {
                    tracing::info!("♻️ Released {released} orphaned queue item(s) back to PENDING");
                }
            }
            OrphanPolicy::Hold => {
                let held = self.db.count_orphans()?;
                if held > 0 {
                    tracing::warn!("🔒 {held} orphaned queue item(s) held for inspection");
                }
            }
        }
        Ok(())
    }

    /// Take over from an earlier batch: close it if it is still marked
    /// RUNNING and hand its unprocessed items back to the queue. Items it
    /// already finished are no longer PENDING and will not be re-dispatched.
    fn prepare_resume(&self, batch_id: &str) -> Result<()> {
        let state = self
            .db
            .get_execution_state(batch_id)?
            .ok_or_else(|| TieringError::BatchNotFound(batch_id.to_string()))?;

        match self.runner.checkpointer().last_checkpoint(batch_id)? {
            Some(cp) => tracing::info!(
                "↩️ Resuming after {batch_id}: checkpoint at {} (item {}, {} completed)",
                cp.at,
                cp.last_queue_id,
                cp.completed
            ),
            None => tracing::info!("↩️ Resuming after {batch_id}: no checkpoint recorded"),
        }

        if state.status == BatchStatus::Running {
            let (completed, failed) = self.batch_counts(batch_id)?;
            self.db.finish_execution_state(
                batch_id,
                BatchStatus::Failed,
                self.clock.now(),
                completed,
                failed,
            )?;
            tracing::warn!("Batch {batch_id} was still RUNNING; marked FAILED (superseded)");
        }

        let released = self.db.release_orphans(Some(batch_id))?;
        tracing::info!("♻️ {released} item(s) of {batch_id} returned to the queue");
        Ok(())
    }
}

/// Periodic trigger: wake every `interval`, ask the gate, run if allowed.
/// Errors are logged and the loop keeps going.
pub async fn spawn_trigger(
    orchestrator: Arc<ExecutionOrchestrator>,
    schedule_name: String,
    interval: Duration,
) {
    tracing::info!(
        "⏰ Trigger started for '{}' (check every {}s)",
        schedule_name,
        interval.as_secs()
    );

    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        match orchestrator.should_execute_now(&schedule_name) {
            Ok(true) => {
                if let Err(e) = orchestrator.execute(&schedule_name, None, false).await {
                    tracing::error!("Trigger run for '{schedule_name}' failed: {e}");
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("⚠️ Gate check for '{schedule_name}' failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::executor::DryRunExecutor;
    use crate::model::{PartitionTarget, Policy};
    use crate::persistence::MAX_PARTITIONS_PER_BATCH;
    use chrono::{NaiveDate, NaiveDateTime, Weekday};

    fn monday(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<TieringDb>,
        clock: Arc<ManualClock>,
        orchestrator: ExecutionOrchestrator,
    }

    fn fixture(now: NaiveDateTime, items: usize, policy: OrphanPolicy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiering.db");
        let db = Arc::new(TieringDb::open(&path).unwrap());
        let log = Arc::new(ExecutionLog::open(&path).unwrap());
        let clock = Arc::new(ManualClock::new(now));
        db.save_schedule(&ScheduleConfig::new("NIGHTLY").with_window(Weekday::Mon, "02:00-04:00"))
            .unwrap();
        db.save_policy(&Policy::new(1, "p", "COMPRESS", 100)).unwrap();
        for n in 0..items {
            db.enqueue(
                1,
                &PartitionTarget { owner: "O".into(), table: "T".into(), partition: format!("P{n}") },
            )
            .unwrap();
        }
        let orchestrator =
            ExecutionOrchestrator::new(db.clone(), log, Arc::new(DryRunExecutor), clock.clone(), policy);
        Fixture { _dir: dir, db, clock, orchestrator }
    }

    #[tokio::test]
    async fn test_closed_window_does_nothing() {
        let f = fixture(monday(12, 0), 3, OrphanPolicy::Release);
        let report = f.orchestrator.execute("NIGHTLY", None, false).await.unwrap();
        assert_eq!(report.exit_reason, ExitReason::WindowNotOpenAtStart);
        assert!(report.batches.is_empty());
        assert_eq!(f.db.count_pending().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_force_run_ignores_window() {
        let f = fixture(monday(12, 0), 3, OrphanPolicy::Release);
        let report = f.orchestrator.execute("NIGHTLY", None, true).await.unwrap();
        assert_eq!(report.exit_reason, ExitReason::NoWork);
        assert_eq!(report.dispatched(), 3);
    }

    #[tokio::test]
    async fn test_unknown_schedule_is_fatal() {
        let f = fixture(monday(2, 30), 3, OrphanPolicy::Release);
        let err = f.orchestrator.execute("MISSING", None, true).await.unwrap_err();
        assert!(matches!(err, TieringError::ScheduleNotFound(_)));
        assert_eq!(f.db.count_pending().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cooldown_can_outlast_window() {
        let f = fixture(monday(3, 50), 15, OrphanPolicy::Release);
        let mut s = f.db.get_schedule("NIGHTLY").unwrap();
        s.batch_cooldown_minutes = 15;
        f.db.save_schedule(&s).unwrap();

        let report = f.orchestrator.execute("NIGHTLY", None, false).await.unwrap();
        assert_eq!(report.exit_reason, ExitReason::WindowClosedDuringCooldown);
        assert_eq!(report.batches.len(), 1);
        assert_eq!(f.clock.now(), monday(4, 5));
        assert_eq!(f.db.count_pending().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_batch_ids_are_unique_within_a_second() {
        let f = fixture(monday(2, 30), 25, OrphanPolicy::Release);
        let report = f.orchestrator.execute("NIGHTLY", None, false).await.unwrap();
        let ids: Vec<_> = report.batches.iter().map(|b| b.batch_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["BATCH_20261019_023000_001", "BATCH_20261019_023000_002", "BATCH_20261019_023000_003"]
        );

        // A second invocation in the same second skips ids already stored.
        f.db.enqueue(1, &PartitionTarget { owner: "O".into(), table: "T".into(), partition: "X".into() })
            .unwrap();
        let again = f.orchestrator.execute("NIGHTLY", None, false).await.unwrap();
        assert_eq!(again.batches[0].batch_id, "BATCH_20261019_023000_004");
    }

    #[tokio::test]
    async fn test_stale_running_batch_blocks_until_resumed() {
        let f = fixture(monday(2, 30), 4, OrphanPolicy::Release);
        f.db.create_execution_state("BATCH_CRASHED", "NIGHTLY", monday(2, 0), 4).unwrap();
        let items = f.db.select_batch_items(2).unwrap();
        for (n, item) in items.iter().enumerate() {
            f.db.tag_queue_item(item.queue_id, "BATCH_CRASHED", n as u32 + 1).unwrap();
        }
        f.db.set_queue_status(items[0].queue_id, QueueStatus::Completed).unwrap();

        assert!(!f.orchestrator.should_execute_now("NIGHTLY").unwrap());
        assert!(matches!(
            f.orchestrator.execute("NIGHTLY", None, false).await,
            Err(TieringError::ConcurrentRun(_))
        ));

        let report = f.orchestrator.execute("NIGHTLY", Some("BATCH_CRASHED"), false).await.unwrap();
        assert_eq!(report.exit_reason, ExitReason::NoWork);
        assert_eq!(report.dispatched(), 3, "the completed item is not re-dispatched");
        let crashed = f.db.get_execution_state("BATCH_CRASHED").unwrap().unwrap();
        assert_eq!(crashed.status, BatchStatus::Failed);
        assert_eq!(crashed.completed_operations, 1);
    }

    #[tokio::test]
    async fn test_resume_of_unknown_batch_is_fatal() {
        let f = fixture(monday(2, 30), 2, OrphanPolicy::Release);
        let err = f.orchestrator.execute("NIGHTLY", Some("BATCH_NOPE"), false).await.unwrap_err();
        assert!(matches!(err, TieringError::BatchNotFound(_)));
        assert_eq!(f.db.count_pending().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_orphan_policy_hold_keeps_items_out_of_selection() {
        let f = fixture(monday(2, 30), 3, OrphanPolicy::Hold);
        f.db.create_execution_state("BATCH_OLD", "NIGHTLY", monday(1, 0), 1).unwrap();
        let first = f.db.select_batch_items(1).unwrap()[0].queue_id;
        f.db.tag_queue_item(first, "BATCH_OLD", 1).unwrap();
        f.db.finish_execution_state("BATCH_OLD", BatchStatus::Failed, monday(1, 5), 0, 0).unwrap();

        let report = f.orchestrator.execute("NIGHTLY", None, false).await.unwrap();
        assert_eq!(report.dispatched(), 2);
        assert_eq!(f.db.count_orphans().unwrap(), 1);
        let held = f.db.get_queue_item(first).unwrap().unwrap();
        assert_eq!(held.execution_status, QueueStatus::Pending);
        assert_eq!(held.batch_id.as_deref(), Some("BATCH_OLD"));
    }

    #[tokio::test]
    async fn test_orphan_policy_release_requeues_at_start() {
        let f = fixture(monday(2, 30), 3, OrphanPolicy::Release);
        f.db.create_execution_state("BATCH_OLD", "NIGHTLY", monday(1, 0), 1).unwrap();
        let first = f.db.select_batch_items(1).unwrap()[0].queue_id;
        f.db.tag_queue_item(first, "BATCH_OLD", 1).unwrap();
        f.db.finish_execution_state("BATCH_OLD", BatchStatus::Failed, monday(1, 5), 0, 0).unwrap();

        let report = f.orchestrator.execute("NIGHTLY", None, false).await.unwrap();
        assert_eq!(report.dispatched(), 3);
        assert_eq!(
            f.db.get_queue_item(first).unwrap().unwrap().execution_status,
            QueueStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_stop_the_loop() {
        let f = fixture(monday(2, 30), 5, OrphanPolicy::Release);
        f.db.set_config_value(MAX_PARTITIONS_PER_BATCH, "3").unwrap();
        let mut s = f.db.get_schedule("NIGHTLY").unwrap();
        s.enable_checkpointing = true;
        s.checkpoint_frequency = 2;
        f.db.save_schedule(&s).unwrap();

        // Checkpoint writes of the first batch fail.
        let conn = rusqlite::Connection::open(f._dir.path().join("tiering.db")).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER fail_first_checkpoint
             BEFORE UPDATE OF last_checkpoint ON tiering_execution_state
             WHEN NEW.batch_id GLOB '*_001'
             BEGIN SELECT RAISE(ABORT, 'checkpoint store unavailable'); END;",
        )
        .unwrap();
        drop(conn);

        let report = f.orchestrator.execute("NIGHTLY", None, false).await.unwrap();
        assert_eq!(report.exit_reason, ExitReason::NoWork);
        assert_eq!(report.batches.len(), 2);

        let failed = &report.batches[0];
        assert_eq!(failed.status, BatchStatus::Failed);
        assert!(failed.outcome.is_none());
        assert!(failed.error.is_some());
        let state = f.db.get_execution_state(&failed.batch_id).unwrap().unwrap();
        assert_eq!(state.status, BatchStatus::Failed);
        assert!(state.end_time.is_some());
        assert_eq!((state.completed_operations, state.failed_operations), (2, 0));

        let next = &report.batches[1];
        assert_eq!(next.status, BatchStatus::Completed);
        assert_eq!(next.outcome.as_ref().unwrap().dispatched, 3);
        assert_eq!(f.db.count_pending().unwrap(), 0);
    }
}
