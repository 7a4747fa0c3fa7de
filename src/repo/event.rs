use rusqlite::{Connection, Result};

use crate::models::{Phase, StageEvent, StageStatus};

/// Append-only audit trail of stage transitions
pub struct EventRepo;

impl EventRepo {
    pub fn record(
        conn: &Connection,
        task_id: i64,
        phase: Phase,
        from: Option<StageStatus>,
        to: StageStatus,
        detail: Option<&str>,
        now: i64,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO stage_events (task_id, phase, from_status, to_status, detail, created_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![task_id, phase, from, to, detail, now],
        )?;
        Ok(())
    }

    pub fn list_for_task(conn: &Connection, task_id: i64) -> Result<Vec<StageEvent>> {
        let mut stmt = conn.prepare(
            "SELECT id, task_id, phase, from_status, to_status, detail, created_ts
             FROM stage_events WHERE task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([task_id], |row| {
            Ok(StageEvent {
                id: row.get(0)?,
                task_id: row.get(1)?,
                phase: row.get(2)?,
                from_status: row.get(3)?,
                to_status: row.get(4)?,
                detail: row.get(5)?,
                created_ts: row.get(6)?,
            })
        })?;
        rows.collect()
    }
}
