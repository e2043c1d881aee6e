//! Should-execute gate.
//!
//! Exclusion across invocations relies on the persisted RUNNING batch row,
//! not on in-process locks: triggers may live in separate processes.

use std::sync::Arc;

use tiering_core::Result;

use crate::clock::Clock;
use crate::persistence::TieringDb;
use crate::schedule::in_window;

/// Why the gate opened or stayed shut.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Execute,
    AlreadyRunning { batch_id: String },
    NoWork,
    OutsideWindow,
}

pub struct ConcurrencyGuard {
    db: Arc<TieringDb>,
    clock: Arc<dyn Clock>,
}

impl ConcurrencyGuard {
    pub fn new(db: Arc<TieringDb>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Checks, in order: a running batch, pending work, the window.
    /// The schedule is only resolved once the first two pass.
    pub fn evaluate(&self, schedule_name: &str) -> Result<GateDecision> {
        if let Some(running) = self.db.running_batch(schedule_name)? {
            return Ok(GateDecision::AlreadyRunning { batch_id: running.batch_id });
        }
        if self.db.count_pending()? == 0 {
            return Ok(GateDecision::NoWork);
        }
        let schedule = self.db.get_schedule(schedule_name)?;
        if !in_window(&schedule, self.clock.now()) {
            return Ok(GateDecision::OutsideWindow);
        }
        Ok(GateDecision::Execute)
    }

    pub fn should_execute_now(&self, schedule_name: &str) -> Result<bool> {
        let decision = self.evaluate(schedule_name)?;
        match &decision {
            GateDecision::Execute => tracing::debug!("🟢 '{schedule_name}' may execute"),
            GateDecision::AlreadyRunning { batch_id } => {
                tracing::info!("⏸️ '{schedule_name}' skipped: batch {batch_id} still RUNNING")
            }
            GateDecision::NoWork => tracing::debug!("'{schedule_name}' skipped: no eligible work"),
            GateDecision::OutsideWindow => {
                tracing::debug!("'{schedule_name}' skipped: outside execution window")
            }
        }
        Ok(decision == GateDecision::Execute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{PartitionTarget, Policy};
    use crate::schedule::ScheduleConfig;
    use chrono::{NaiveDate, NaiveDateTime, Weekday};
    use tiering_core::TieringError;

    fn monday(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    fn setup(now: NaiveDateTime, items: usize) -> (tempfile::TempDir, Arc<TieringDb>, ConcurrencyGuard) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(TieringDb::open(&dir.path().join("tiering.db")).unwrap());
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
        let guard = ConcurrencyGuard::new(db.clone(), Arc::new(ManualClock::new(now)));
        (dir, db, guard)
    }

    #[test]
    fn test_open_window_with_work_executes() {
        let (_dir, _db, guard) = setup(monday(2, 30), 3);
        assert!(guard.should_execute_now("NIGHTLY").unwrap());
    }

    #[test]
    fn test_running_batch_wins_over_everything() {
        let (_dir, db, guard) = setup(monday(2, 30), 3);
        db.create_execution_state("BATCH_X", "NIGHTLY", monday(2, 0), 3).unwrap();
        assert_eq!(
            guard.evaluate("NIGHTLY").unwrap(),
            GateDecision::AlreadyRunning { batch_id: "BATCH_X".into() }
        );
        assert!(!guard.should_execute_now("NIGHTLY").unwrap());
    }

    #[test]
    fn test_no_work_inside_open_window() {
        let (_dir, _db, guard) = setup(monday(2, 30), 0);
        assert_eq!(guard.evaluate("NIGHTLY").unwrap(), GateDecision::NoWork);
    }

    #[test]
    fn test_outside_window() {
        let (_dir, _db, guard) = setup(monday(12, 0), 3);
        assert_eq!(guard.evaluate("NIGHTLY").unwrap(), GateDecision::OutsideWindow);
    }

    #[test]
    fn test_unknown_schedule_only_matters_once_work_exists() {
        let (_dir, _db, guard) = setup(monday(2, 30), 0);
        assert_eq!(guard.evaluate("MISSING").unwrap(), GateDecision::NoWork);

        let (_dir, _db, guard) = setup(monday(2, 30), 1);
        assert!(matches!(guard.evaluate("MISSING"), Err(TieringError::ScheduleNotFound(_))));
    }
}
