//! SQLite-backed persistence for schedules, policies, the work queue and
//! batch execution state.
//!
//! Every mutation is a single autocommitted statement, so a concurrent
//! reader never observes a half-updated queue item or batch row.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tiering_core::{Result, TieringError};

use crate::model::{
    BatchStatus, ExecutionState, PartitionTarget, Policy, QueueItem, QueueStatus,
};
use crate::schedule::{ScheduleConfig, WeeklyWindows};

/// Setting key for the global batch size limit.
pub const MAX_PARTITIONS_PER_BATCH: &str = "MAX_PARTITIONS_PER_BATCH";
/// Batch size used when the setting is absent or unparsable.
pub const DEFAULT_BATCH_SIZE: u32 = 10;

pub(crate) const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

pub(crate) fn fmt_ts(t: NaiveDateTime) -> String {
    t.format(TS_FORMAT).to_string()
}

pub(crate) fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn db_err(context: &str, e: rusqlite::Error) -> TieringError {
    TieringError::Database(format!("{context}: {e}"))
}

pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(|e| db_err("DB open", e))?;
    // WAL lets the audit connection write while the engine connection reads.
    conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(|e| db_err("Busy timeout", e))?;
    Ok(conn)
}

/// Engine-side store: everything except the execution log.
pub struct TieringDb {
    conn: Mutex<Connection>,
}

impl TieringDb {
    /// Open or create the tiering database.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Self { conn: Mutex::new(open_connection(path)?) };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TieringError::Database(format!("Lock: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            -- Global engine settings (key/value)
            CREATE TABLE IF NOT EXISTS tiering_config (
                config_key TEXT PRIMARY KEY,
                config_value TEXT NOT NULL
            );

            -- Execution schedules: one optional HH:MM-HH:MM window per weekday
            CREATE TABLE IF NOT EXISTS tiering_schedules (
                schedule_name TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL DEFAULT 1,
                monday_hours TEXT,
                tuesday_hours TEXT,
                wednesday_hours TEXT,
                thursday_hours TEXT,
                friday_hours TEXT,
                saturday_hours TEXT,
                sunday_hours TEXT,
                batch_cooldown_minutes INTEGER NOT NULL DEFAULT 0,
                enable_checkpointing INTEGER NOT NULL DEFAULT 0,
                checkpoint_frequency INTEGER NOT NULL DEFAULT 5
            );

            -- Tiering policies (owned by the policy evaluator)
            CREATE TABLE IF NOT EXISTS tiering_policies (
                policy_id INTEGER PRIMARY KEY,
                policy_name TEXT NOT NULL,
                action_type TEXT NOT NULL,       -- COMPRESS, MOVE, READ_ONLY, DROP, TRUNCATE, MERGE
                compression_type TEXT,
                target_location TEXT,
                priority INTEGER NOT NULL DEFAULT 100,
                enabled INTEGER NOT NULL DEFAULT 1
            );

            -- Work queue (rows produced by the policy evaluator)
            CREATE TABLE IF NOT EXISTS tiering_queue (
                queue_id INTEGER PRIMARY KEY AUTOINCREMENT,
                policy_id INTEGER NOT NULL,
                table_owner TEXT NOT NULL,
                table_name TEXT NOT NULL,
                partition_name TEXT NOT NULL,
                eligible INTEGER NOT NULL DEFAULT 1,
                execution_status TEXT NOT NULL DEFAULT 'PENDING',
                batch_id TEXT,
                execution_sequence INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_tiering_queue_pending
                ON tiering_queue(execution_status, eligible, batch_id);

            -- One row per batch attempt
            CREATE TABLE IF NOT EXISTS tiering_execution_state (
                batch_id TEXT PRIMARY KEY,
                schedule_name TEXT NOT NULL,
                status TEXT NOT NULL,            -- RUNNING, COMPLETED, FAILED
                start_time TEXT NOT NULL,
                end_time TEXT,
                elapsed_seconds REAL NOT NULL DEFAULT 0,
                total_operations INTEGER NOT NULL DEFAULT 0,
                completed_operations INTEGER NOT NULL DEFAULT 0,
                failed_operations INTEGER NOT NULL DEFAULT 0,
                last_checkpoint TEXT,
                last_queue_id INTEGER,
                checkpoint_completed INTEGER NOT NULL DEFAULT 0
            );
            -- At most one RUNNING batch per schedule
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tiering_one_running
                ON tiering_execution_state(schedule_name) WHERE status = 'RUNNING';
         ",
            )
            .map_err(|e| db_err("Migration", e))?;
        Ok(())
    }

    // ─── Settings ──────────────────────────────────────────

    pub fn get_config_value(&self, key: &str) -> Result<Option<String>> {
        self.conn()?
            .query_row(
                "SELECT config_value FROM tiering_config WHERE config_key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_err("Get config", e))
    }

    pub fn set_config_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO tiering_config (config_key, config_value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(|e| db_err("Set config", e))?;
        Ok(())
    }

    /// Global batch size limit; 10 when unset.
    pub fn max_partitions_per_batch(&self) -> Result<u32> {
        let limit = self
            .get_config_value(MAX_PARTITIONS_PER_BATCH)?
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|n| *n > 0);
        if limit.is_none() {
            tracing::debug!("{MAX_PARTITIONS_PER_BATCH} unset, using {DEFAULT_BATCH_SIZE}");
        }
        Ok(limit.unwrap_or(DEFAULT_BATCH_SIZE))
    }

    // ─── Schedules ─────────────────────────────────────────

    pub fn save_schedule(&self, schedule: &ScheduleConfig) -> Result<()> {
        let w = &schedule.windows;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO tiering_schedules
                 (schedule_name, enabled, monday_hours, tuesday_hours, wednesday_hours,
                  thursday_hours, friday_hours, saturday_hours, sunday_hours,
                  batch_cooldown_minutes, enable_checkpointing, checkpoint_frequency)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    schedule.schedule_name,
                    schedule.enabled as i32,
                    w.monday,
                    w.tuesday,
                    w.wednesday,
                    w.thursday,
                    w.friday,
                    w.saturday,
                    w.sunday,
                    schedule.batch_cooldown_minutes,
                    schedule.enable_checkpointing as i32,
                    schedule.checkpoint_frequency,
                ],
            )
            .map_err(|e| db_err("Save schedule", e))?;
        Ok(())
    }

    /// Resolve an enabled schedule by name.
    pub fn get_schedule(&self, name: &str) -> Result<ScheduleConfig> {
        self.find_schedule(name)?
            .filter(|s| s.enabled)
            .ok_or_else(|| TieringError::ScheduleNotFound(name.to_string()))
    }

    /// Look up a schedule whether or not it is enabled.
    pub fn find_schedule(&self, name: &str) -> Result<Option<ScheduleConfig>> {
        self.conn()?
            .query_row(
                "SELECT schedule_name, enabled, monday_hours, tuesday_hours, wednesday_hours,
                        thursday_hours, friday_hours, saturday_hours, sunday_hours,
                        batch_cooldown_minutes, enable_checkpointing, checkpoint_frequency
                 FROM tiering_schedules WHERE schedule_name = ?1",
                [name],
                |row| {
                    Ok(ScheduleConfig {
                        schedule_name: row.get(0)?,
                        enabled: row.get::<_, i32>(1)? != 0,
                        windows: WeeklyWindows {
                            monday: row.get(2)?,
                            tuesday: row.get(3)?,
                            wednesday: row.get(4)?,
                            thursday: row.get(5)?,
                            friday: row.get(6)?,
                            saturday: row.get(7)?,
                            sunday: row.get(8)?,
                        },
                        batch_cooldown_minutes: row.get(9)?,
                        enable_checkpointing: row.get::<_, i32>(10)? != 0,
                        checkpoint_frequency: row.get(11)?,
                    })
                },
            )
            .optional()
            .map_err(|e| db_err("Get schedule", e))
    }

    // ─── Policies ──────────────────────────────────────────

    pub fn save_policy(&self, policy: &Policy) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO tiering_policies
                 (policy_id, policy_name, action_type, compression_type, target_location, priority, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    policy.policy_id,
                    policy.policy_name,
                    policy.action_type,
                    policy.compression_type,
                    policy.target_location,
                    policy.priority,
                    policy.enabled as i32,
                ],
            )
            .map_err(|e| db_err("Save policy", e))?;
        Ok(())
    }

    pub fn get_policy(&self, policy_id: i64) -> Result<Option<Policy>> {
        self.conn()?
            .query_row(
                "SELECT policy_id, policy_name, action_type, compression_type, target_location,
                        priority, enabled
                 FROM tiering_policies WHERE policy_id = ?1",
                [policy_id],
                |row| {
                    Ok(Policy {
                        policy_id: row.get(0)?,
                        policy_name: row.get(1)?,
                        action_type: row.get(2)?,
                        compression_type: row.get(3)?,
                        target_location: row.get(4)?,
                        priority: row.get(5)?,
                        enabled: row.get::<_, i32>(6)? != 0,
                    })
                },
            )
            .optional()
            .map_err(|e| db_err("Get policy", e))
    }

    // ─── Work queue ────────────────────────────────────────

    /// Insert an eligible PENDING item. This is the policy evaluator's side
    /// of the queue; the engine itself never enqueues.
    pub fn enqueue(&self, policy_id: i64, target: &PartitionTarget) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tiering_queue (policy_id, table_owner, table_name, partition_name)
             VALUES (?1, ?2, ?3, ?4)",
            params![policy_id, target.owner, target.table, target.partition],
        )
        .map_err(|e| db_err("Enqueue", e))?;
        Ok(conn.last_insert_rowid())
    }

    /// Evaluator-side toggle of the `eligible` flag.
    pub fn set_eligible(&self, queue_id: i64, eligible: bool) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE tiering_queue SET eligible = ?1 WHERE queue_id = ?2",
                params![eligible as i32, queue_id],
            )
            .map_err(|e| db_err("Set eligible", e))?;
        Ok(())
    }

    pub fn get_queue_item(&self, queue_id: i64) -> Result<Option<QueueItem>> {
        self.conn()?
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM tiering_queue q WHERE q.queue_id = ?1"),
                [queue_id],
                row_to_queue_item,
            )
            .optional()
            .map_err(|e| db_err("Get queue item", e))
    }

    /// Eligible, untagged PENDING items of enabled policies.
    pub fn count_pending(&self) -> Result<u32> {
        self.conn()?
            .query_row(
                &format!("SELECT COUNT(*) {SELECTABLE_FROM}"),
                [],
                |row| row.get(0),
            )
            .map_err(|e| db_err("Count pending", e))
    }

    /// Next slice of work: priority ascending, then queue id ascending.
    pub fn select_batch_items(&self, limit: u32) -> Result<Vec<QueueItem>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {QUEUE_COLUMNS} {SELECTABLE_FROM}
                 ORDER BY p.priority ASC, q.queue_id ASC LIMIT ?1"
            ))
            .map_err(|e| db_err("Select batch", e))?;
        let items = stmt
            .query_map([limit], row_to_queue_item)
            .map_err(|e| db_err("Select batch", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Select batch", e))?;
        Ok(items)
    }

    /// Claim an item for a batch. Returns false if it is no longer claimable.
    pub fn tag_queue_item(&self, queue_id: i64, batch_id: &str, sequence: u32) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE tiering_queue SET batch_id = ?1, execution_sequence = ?2
                 WHERE queue_id = ?3 AND execution_status = 'PENDING' AND batch_id IS NULL",
                params![batch_id, sequence, queue_id],
            )
            .map_err(|e| db_err("Tag queue item", e))?;
        Ok(changed == 1)
    }

    pub fn set_queue_status(&self, queue_id: i64, status: QueueStatus) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE tiering_queue SET execution_status = ?1 WHERE queue_id = ?2",
                params![status.as_str(), queue_id],
            )
            .map_err(|e| db_err("Set queue status", e))?;
        Ok(())
    }

    pub fn queue_items_for_batch(&self, batch_id: &str) -> Result<Vec<QueueItem>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {QUEUE_COLUMNS} FROM tiering_queue q
                 WHERE q.batch_id = ?1 ORDER BY q.execution_sequence"
            ))
            .map_err(|e| db_err("Batch items", e))?;
        let items = stmt
            .query_map([batch_id], row_to_queue_item)
            .map_err(|e| db_err("Batch items", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Batch items", e))?;
        Ok(items)
    }

    /// Item counts per execution status.
    pub fn queue_summary(&self) -> Result<Vec<(String, u32)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT execution_status, COUNT(*) FROM tiering_queue
                 GROUP BY execution_status ORDER BY execution_status",
            )
            .map_err(|e| db_err("Queue summary", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| db_err("Queue summary", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Queue summary", e))?;
        Ok(rows)
    }

    /// PENDING items still tagged with a batch that is not RUNNING.
    pub fn count_orphans(&self) -> Result<u32> {
        self.conn()?
            .query_row(&format!("SELECT COUNT(*) {ORPHANS_WHERE}"), [], |row| row.get(0))
            .map_err(|e| db_err("Count orphans", e))
    }

    /// Clear the batch tag of orphaned items, optionally only those of one batch.
    pub fn release_orphans(&self, batch_id: Option<&str>) -> Result<usize> {
        let sql = format!(
            "UPDATE tiering_queue SET batch_id = NULL, execution_sequence = NULL
             WHERE queue_id IN (SELECT queue_id {ORPHANS_WHERE} AND (?1 IS NULL OR batch_id = ?1))"
        );
        self.conn()?
            .execute(&sql, params![batch_id])
            .map_err(|e| db_err("Release orphans", e))
    }

    // ─── Execution state ───────────────────────────────────

    /// Insert a RUNNING row. Fails with `ConcurrentRun` if the schedule
    /// already has one.
    pub fn create_execution_state(
        &self,
        batch_id: &str,
        schedule_name: &str,
        start: NaiveDateTime,
        total_operations: u32,
    ) -> Result<()> {
        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO tiering_execution_state
             (batch_id, schedule_name, status, start_time, total_operations)
             VALUES (?1, ?2, 'RUNNING', ?3, ?4)",
            params![batch_id, schedule_name, fmt_ts(start), total_operations],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Err(TieringError::ConcurrentRun(schedule_name.to_string()))
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                Err(TieringError::Database(format!("batch id '{batch_id}' already exists")))
            }
            Err(e) => Err(db_err("Create execution state", e)),
        }
    }

    /// Close a batch with its final status and counters.
    pub fn finish_execution_state(
        &self,
        batch_id: &str,
        status: BatchStatus,
        end: NaiveDateTime,
        completed: u32,
        failed: u32,
    ) -> Result<()> {
        let state = self
            .get_execution_state(batch_id)?
            .ok_or_else(|| TieringError::BatchNotFound(batch_id.to_string()))?;
        let elapsed = elapsed_seconds(state.start_time, end);
        self.conn()?
            .execute(
                "UPDATE tiering_execution_state
                 SET status = ?1, end_time = ?2, elapsed_seconds = ?3,
                     completed_operations = ?4, failed_operations = ?5
                 WHERE batch_id = ?6",
                params![status.as_str(), fmt_ts(end), elapsed, completed, failed, batch_id],
            )
            .map_err(|e| db_err("Finish execution state", e))?;
        Ok(())
    }

    /// Record checkpoint progress and refresh elapsed time.
    pub fn record_checkpoint(
        &self,
        batch_id: &str,
        at: NaiveDateTime,
        last_queue_id: i64,
        completed: u32,
    ) -> Result<()> {
        let state = self
            .get_execution_state(batch_id)?
            .ok_or_else(|| TieringError::BatchNotFound(batch_id.to_string()))?;
        let elapsed = elapsed_seconds(state.start_time, at);
        self.conn()?
            .execute(
                "UPDATE tiering_execution_state
                 SET last_checkpoint = ?1, last_queue_id = ?2, checkpoint_completed = ?3,
                     completed_operations = ?3, elapsed_seconds = ?4
                 WHERE batch_id = ?5",
                params![fmt_ts(at), last_queue_id, completed, elapsed, batch_id],
            )
            .map_err(|e| db_err("Checkpoint", e))?;
        Ok(())
    }

    pub fn get_execution_state(&self, batch_id: &str) -> Result<Option<ExecutionState>> {
        self.conn()?
            .query_row(
                &format!("SELECT {STATE_COLUMNS} FROM tiering_execution_state WHERE batch_id = ?1"),
                [batch_id],
                row_to_execution_state,
            )
            .optional()
            .map_err(|e| db_err("Get execution state", e))
    }

    pub fn batch_exists(&self, batch_id: &str) -> Result<bool> {
        Ok(self.get_execution_state(batch_id)?.is_some())
    }

    /// The RUNNING batch of a schedule, if any.
    pub fn running_batch(&self, schedule_name: &str) -> Result<Option<ExecutionState>> {
        self.conn()?
            .query_row(
                &format!(
                    "SELECT {STATE_COLUMNS} FROM tiering_execution_state
                     WHERE schedule_name = ?1 AND status = 'RUNNING'"
                ),
                [schedule_name],
                row_to_execution_state,
            )
            .optional()
            .map_err(|e| db_err("Running batch", e))
    }

    /// Most recent batches first.
    pub fn recent_execution_states(&self, limit: usize) -> Result<Vec<ExecutionState>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {STATE_COLUMNS} FROM tiering_execution_state
                 ORDER BY start_time DESC, batch_id DESC LIMIT ?1"
            ))
            .map_err(|e| db_err("Recent states", e))?;
        let rows = stmt
            .query_map([limit as i64], row_to_execution_state)
            .map_err(|e| db_err("Recent states", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Recent states", e))?;
        Ok(rows)
    }
}

const QUEUE_COLUMNS: &str = "q.queue_id, q.policy_id, q.table_owner, q.table_name, q.partition_name,
     q.eligible, q.execution_status, q.batch_id, q.execution_sequence";

const SELECTABLE_FROM: &str = "FROM tiering_queue q
     JOIN tiering_policies p ON p.policy_id = q.policy_id
     WHERE q.execution_status = 'PENDING' AND q.eligible = 1 AND p.enabled = 1
       AND q.batch_id IS NULL";

const ORPHANS_WHERE: &str = "FROM tiering_queue
     WHERE execution_status = 'PENDING' AND batch_id IS NOT NULL
       AND batch_id NOT IN (SELECT batch_id FROM tiering_execution_state WHERE status = 'RUNNING')";

const STATE_COLUMNS: &str = "batch_id, schedule_name, status, start_time, end_time, elapsed_seconds,
     total_operations, completed_operations, failed_operations, last_checkpoint, last_queue_id,
     checkpoint_completed";

fn row_to_queue_item(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    Ok(QueueItem {
        queue_id: row.get(0)?,
        policy_id: row.get(1)?,
        table_owner: row.get(2)?,
        table_name: row.get(3)?,
        partition_name: row.get(4)?,
        eligible: row.get::<_, i32>(5)? != 0,
        execution_status: QueueStatus::parse(&row.get::<_, String>(6)?),
        batch_id: row.get(7)?,
        execution_sequence: row.get(8)?,
    })
}

fn row_to_execution_state(row: &Row<'_>) -> rusqlite::Result<ExecutionState> {
    let start: String = row.get(3)?;
    let end: Option<String> = row.get(4)?;
    let last_checkpoint: Option<String> = row.get(9)?;
    Ok(ExecutionState {
        batch_id: row.get(0)?,
        schedule_name: row.get(1)?,
        status: BatchStatus::parse(&row.get::<_, String>(2)?),
        start_time: parse_ts(3, &start)?,
        end_time: end.map(|s| parse_ts(4, &s)).transpose()?,
        elapsed_seconds: row.get(5)?,
        total_operations: row.get(6)?,
        completed_operations: row.get(7)?,
        failed_operations: row.get(8)?,
        last_checkpoint: last_checkpoint.map(|s| parse_ts(9, &s)).transpose()?,
        last_queue_id: row.get(10)?,
        checkpoint_completed: row.get(11)?,
    })
}

pub(crate) fn elapsed_seconds(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}
