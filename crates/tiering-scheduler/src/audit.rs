//! Append-only execution log.
//!
//! Holds its own SQLite connection: a log row is committed on its own and
//! never shares a transaction with the queue or with the action it
//! describes, so a rolled-back action still leaves its failure record.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, Row, params};
use tiering_core::{Result, TieringError};

use crate::model::{ActionStatus, ExecutionLogEntry};
use crate::persistence::{db_err, fmt_ts, open_connection, parse_ts};

/// Writer/reader for `tiering_execution_log`.
pub struct ExecutionLog {
    conn: Mutex<Connection>,
}

impl ExecutionLog {
    /// Open a dedicated connection to the log table.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tiering_execution_log (
                log_id INTEGER PRIMARY KEY AUTOINCREMENT,
                batch_id TEXT,
                queue_id INTEGER NOT NULL,
                policy_id INTEGER,
                table_owner TEXT NOT NULL,
                table_name TEXT NOT NULL,
                partition_name TEXT NOT NULL,
                action_type TEXT NOT NULL,
                operation TEXT,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                duration_seconds REAL NOT NULL,
                size_before_mb REAL,
                size_after_mb REAL,
                space_saved_mb REAL,
                compression_ratio REAL,
                status TEXT NOT NULL,            -- SUCCESS, WARNING, ERROR, SKIPPED
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tiering_log_batch ON tiering_execution_log(batch_id);",
        )
        .map_err(|e| db_err("Log migration", e))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TieringError::Database(format!("Lock: {e}")))
    }

    /// Append one entry. `log_id` on the input is ignored; the assigned id is returned.
    pub fn append(&self, entry: &ExecutionLogEntry) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tiering_execution_log
             (batch_id, queue_id, policy_id, table_owner, table_name, partition_name, action_type,
              operation, start_time, end_time, duration_seconds, size_before_mb, size_after_mb,
              space_saved_mb, compression_ratio, status, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                entry.batch_id,
                entry.queue_id,
                entry.policy_id,
                entry.table_owner,
                entry.table_name,
                entry.partition_name,
                entry.action_type,
                entry.operation,
                fmt_ts(entry.start_time),
                fmt_ts(entry.end_time),
                entry.duration_seconds,
                entry.size_before_mb,
                entry.size_after_mb,
                entry.space_saved_mb,
                entry.compression_ratio,
                entry.status.as_str(),
                entry.error_message,
            ],
        )
        .map_err(|e| db_err("Append log", e))?;
        Ok(conn.last_insert_rowid())
    }

    /// Entries written for one queue item, oldest first.
    pub fn entries_for_queue_item(&self, queue_id: i64) -> Result<Vec<ExecutionLogEntry>> {
        self.query(
            &format!("SELECT {LOG_COLUMNS} FROM tiering_execution_log WHERE queue_id = ?1 ORDER BY log_id"),
            params![queue_id],
        )
    }

    /// Entries written during one batch, oldest first.
    pub fn entries_for_batch(&self, batch_id: &str) -> Result<Vec<ExecutionLogEntry>> {
        self.query(
            &format!("SELECT {LOG_COLUMNS} FROM tiering_execution_log WHERE batch_id = ?1 ORDER BY log_id"),
            params![batch_id],
        )
    }

    /// Latest entries, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<ExecutionLogEntry>> {
        self.query(
            &format!("SELECT {LOG_COLUMNS} FROM tiering_execution_log ORDER BY log_id DESC LIMIT ?1"),
            params![limit as i64],
        )
    }

    fn query(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<ExecutionLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(|e| db_err("Read log", e))?;
        let rows = stmt
            .query_map(args, row_to_entry)
            .map_err(|e| db_err("Read log", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Read log", e))?;
        Ok(rows)
    }
}

const LOG_COLUMNS: &str = "log_id, batch_id, queue_id, policy_id, table_owner, table_name,
     partition_name, action_type, operation, start_time, end_time, duration_seconds,
     size_before_mb, size_after_mb, space_saved_mb, compression_ratio, status, error_message";

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<ExecutionLogEntry> {
    let start: String = row.get(9)?;
    let end: String = row.get(10)?;
    Ok(ExecutionLogEntry {
        log_id: row.get(0)?,
        batch_id: row.get(1)?,
        queue_id: row.get(2)?,
        policy_id: row.get(3)?,
        table_owner: row.get(4)?,
        table_name: row.get(5)?,
        partition_name: row.get(6)?,
        action_type: row.get(7)?,
        operation: row.get(8)?,
        start_time: parse_ts(9, &start)?,
        end_time: parse_ts(10, &end)?,
        duration_seconds: row.get(11)?,
        size_before_mb: row.get(12)?,
        size_after_mb: row.get(13)?,
        space_saved_mb: row.get(14)?,
        compression_ratio: row.get(15)?,
        status: ActionStatus::parse(&row.get::<_, String>(16)?),
        error_message: row.get(17)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn entry(queue_id: i64, status: ActionStatus) -> ExecutionLogEntry {
        let start = NaiveDate::from_ymd_opt(2026, 10, 19)
            .unwrap()
            .and_hms_milli_opt(2, 5, 0, 250)
            .unwrap();
        ExecutionLogEntry {
            log_id: 0,
            batch_id: Some("BATCH_20261019_020500_001".into()),
            queue_id,
            policy_id: Some(1),
            table_owner: "SALES".into(),
            table_name: "ORDERS".into(),
            partition_name: "P_2020_01".into(),
            action_type: "COMPRESS".into(),
            operation: Some("ALTER TABLE ...".into()),
            start_time: start,
            end_time: start + chrono::Duration::seconds(3),
            duration_seconds: 3.0,
            size_before_mb: Some(120.0),
            size_after_mb: Some(30.0),
            space_saved_mb: Some(90.0),
            compression_ratio: Some(4.0),
            status,
            error_message: None,
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExecutionLog::open(&dir.path().join("tiering.db")).unwrap();

        let id = log.append(&entry(7, ActionStatus::Success)).unwrap();
        log.append(&entry(8, ActionStatus::Error)).unwrap();

        let rows = log.entries_for_queue_item(7).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].log_id, id);
        assert_eq!(rows[0].start_time, entry(7, ActionStatus::Success).start_time);
        assert_eq!(rows[0].compression_ratio, Some(4.0));

        assert_eq!(log.entries_for_batch("BATCH_20261019_020500_001").unwrap().len(), 2);
        assert_eq!(log.recent(1).unwrap()[0].status, ActionStatus::Error);
    }

    #[test]
    fn test_log_shares_file_with_engine_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiering.db");
        let _db = crate::persistence::TieringDb::open(&path).unwrap();
        let writer = ExecutionLog::open(&path).unwrap();
        let reader = ExecutionLog::open(&path).unwrap();

        writer.append(&entry(1, ActionStatus::Skipped)).unwrap();
        assert_eq!(reader.entries_for_queue_item(1).unwrap().len(), 1);
    }
}
