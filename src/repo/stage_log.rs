use rusqlite::{Connection, Result};

use crate::models::{Phase, StageLogLine};

/// Per-phase output lines, append-only
pub struct StageLogRepo;

impl StageLogRepo {
    pub fn append(conn: &Connection, task_id: i64, phase: Phase, line: &str, now: i64) -> Result<i64> {
        conn.execute(
            "INSERT INTO stage_logs (task_id, phase, line, created_ts) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![task_id, phase, line, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Line texts of one phase in append order
    pub fn lines(conn: &Connection, task_id: i64, phase: Phase) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT line FROM stage_logs WHERE task_id = ?1 AND phase = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(rusqlite::params![task_id, phase], |row| row.get(0))?;
        rows.collect()
    }

    /// Lines of a task, optionally narrowed to one phase and a `[since, until)` window
    pub fn list(
        conn: &Connection,
        task_id: i64,
        phase: Option<Phase>,
        since: Option<i64>,
        until: Option<i64>,
    ) -> Result<Vec<StageLogLine>> {
        let mut stmt = conn.prepare(
            "SELECT id, task_id, phase, line, created_ts FROM stage_logs
             WHERE task_id = ?1
               AND (?2 IS NULL OR phase = ?2)
               AND (?3 IS NULL OR created_ts >= ?3)
               AND (?4 IS NULL OR created_ts < ?4)
             ORDER BY id",
        )?;
        let rows = stmt.query_map(rusqlite::params![task_id, phase, since, until], |row| {
            Ok(StageLogLine {
                id: row.get(0)?,
                task_id: row.get(1)?,
                phase: row.get(2)?,
                line: row.get(3)?,
                created_ts: row.get(4)?,
            })
        })?;
        rows.collect()
    }
}
