//! The stage queue: one authoritative row per task
//!
//! Every state change is a single compare-and-swap `UPDATE ... WHERE <expected>`
//! whose affected-row count decides the outcome, so concurrent workers in
//! different processes never both win the same transition.

use log::{info, warn};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{Result, StageError};
use crate::models::{advance, Phase, StageRecord, StageStatus};
use crate::repo::{atomically, EventRepo, StageLogRepo};

const SELECT_RECORD: &str = "SELECT r.task_id, r.phase, r.status, r.error, r.retry_count,
        r.created_ts, r.started_ts, r.finished_ts, r.modified_ts
     FROM stage_records r";

fn map_record(row: &Row) -> rusqlite::Result<StageRecord> {
    Ok(StageRecord {
        task_id: row.get(0)?,
        phase: row.get(1)?,
        status: row.get(2)?,
        error: row.get(3)?,
        retry_count: row.get(4)?,
        created_ts: row.get(5)?,
        started_ts: row.get(6)?,
        finished_ts: row.get(7)?,
        modified_ts: row.get(8)?,
    })
}

/// Answer of a non-blocking stage acquire
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    Acquired(StageRecord),
    NotEligible { current: StageRecord },
}

/// Queue counts for one phase; cancelled records are left out
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhaseSummary {
    pub phase: Option<Phase>,
    pub waiting: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Stage queue repository
pub struct StageRepo;

impl StageRepo {
    /// Record the transition in the audit stream and the phase log
    fn note(
        conn: &Connection,
        task_id: i64,
        phase: Phase,
        from: Option<StageStatus>,
        to: StageStatus,
        detail: Option<&str>,
        now: i64,
    ) -> rusqlite::Result<()> {
        EventRepo::record(conn, task_id, phase, from, to, detail, now)?;
        let line = match from {
            Some(from) => format!("stage {} {} -> {}", phase, from, to),
            None => format!("stage {} -> {}", phase, to),
        };
        StageLogRepo::append(conn, task_id, phase, &line, now)?;
        info!(task = task_id, phase = phase.as_str(), status = to.as_str(); "stage transition");
        Ok(())
    }

    pub fn get(conn: &Connection, task_id: i64) -> Result<Option<StageRecord>> {
        let sql = format!("{} WHERE r.task_id = ?1", SELECT_RECORD);
        Ok(conn.query_row(&sql, [task_id], map_record).optional()?)
    }

    pub fn require(conn: &Connection, task_id: i64) -> Result<StageRecord> {
        Self::get(conn, task_id)?.ok_or(StageError::TaskNotFound(task_id))
    }

    fn illegal(conn: &Connection, task_id: i64, to: StageStatus) -> StageError {
        match Self::require(conn, task_id) {
            Ok(current) => StageError::IllegalTransition {
                task_id,
                phase: current.phase,
                from: current.status,
                to,
            },
            Err(err) => err,
        }
    }

    /// Insert the first record of a freshly created task: schedule, waiting
    pub fn create_initial(conn: &Connection, task_id: i64, now: i64) -> Result<StageRecord> {
        atomically(conn, || {
            conn.execute(
                "INSERT INTO stage_records (task_id, phase, status, created_ts, modified_ts)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                rusqlite::params![task_id, Phase::Schedule, StageStatus::Waiting, now],
            )?;
            Self::note(conn, task_id, Phase::Schedule, None, StageStatus::Waiting, None, now)?;
            Self::require(conn, task_id)
        })
    }

    /// waiting → processing at `phase`. Idempotent: a second caller, or a
    /// caller naming the wrong phase, gets `NotEligible` with the current row.
    pub fn acquire_stage(
        conn: &Connection,
        task_id: i64,
        phase: Phase,
        now: i64,
    ) -> Result<AcquireOutcome> {
        atomically(conn, || {
            let changed = conn.execute(
                "UPDATE stage_records
                 SET status = 'processing', started_ts = ?3, finished_ts = NULL, error = NULL,
                     modified_ts = ?3
                 WHERE task_id = ?1 AND phase = ?2 AND status = 'waiting'",
                rusqlite::params![task_id, phase, now],
            )?;
            if changed == 0 {
                let current = Self::require(conn, task_id)?;
                return Ok(AcquireOutcome::NotEligible { current });
            }
            Self::note(
                conn,
                task_id,
                phase,
                Some(StageStatus::Waiting),
                StageStatus::Processing,
                None,
                now,
            )?;
            Ok(AcquireOutcome::Acquired(Self::require(conn, task_id)?))
        })
    }

    /// processing → completed. A non-terminal phase is rewritten in place to
    /// the next phase, waiting; the terminal phase stays completed and marks
    /// the task done.
    pub fn complete_stage(conn: &Connection, task_id: i64, phase: Phase, now: i64) -> Result<StageRecord> {
        atomically(conn, || {
            let (next_phase, next_status) = advance(phase, StageStatus::Completed);
            let finished: Option<i64> = (next_status == StageStatus::Completed).then_some(now);
            let changed = conn.execute(
                "UPDATE stage_records
                 SET phase = ?3, status = ?4, error = NULL, finished_ts = ?5,
                     started_ts = CASE WHEN ?4 = 'waiting' THEN NULL ELSE started_ts END,
                     retry_count = CASE WHEN ?4 = 'waiting' THEN 0 ELSE retry_count END,
                     modified_ts = ?6
                 WHERE task_id = ?1 AND phase = ?2 AND status = 'processing'",
                rusqlite::params![task_id, phase, next_phase, next_status, finished, now],
            )?;
            if changed == 0 {
                return Err(Self::illegal(conn, task_id, StageStatus::Completed));
            }

            Self::note(
                conn,
                task_id,
                phase,
                Some(StageStatus::Processing),
                StageStatus::Completed,
                None,
                now,
            )?;
            if next_phase != phase {
                let detail = format!("advanced from {}", phase);
                Self::note(
                    conn,
                    task_id,
                    next_phase,
                    Some(StageStatus::Completed),
                    next_status,
                    Some(&detail),
                    now,
                )?;
            } else {
                conn.execute(
                    "UPDATE tasks SET done = 1, done_ts = ?2, modified_ts = ?2 WHERE id = ?1",
                    rusqlite::params![task_id, now],
                )?;
                info!(task = task_id; "task done");
            }
            Self::require(conn, task_id)
        })
    }

    /// processing → failed; phase unchanged, error text kept on the record
    pub fn fail_stage(
        conn: &Connection,
        task_id: i64,
        phase: Phase,
        error: &str,
        now: i64,
    ) -> Result<StageRecord> {
        atomically(conn, || {
            let changed = conn.execute(
                "UPDATE stage_records
                 SET status = 'failed', error = ?3, finished_ts = ?4, modified_ts = ?4
                 WHERE task_id = ?1 AND phase = ?2 AND status = 'processing'",
                rusqlite::params![task_id, phase, error, now],
            )?;
            if changed == 0 {
                return Err(Self::illegal(conn, task_id, StageStatus::Failed));
            }
            Self::note(
                conn,
                task_id,
                phase,
                Some(StageStatus::Processing),
                StageStatus::Failed,
                Some(error),
                now,
            )?;
            warn!(task = task_id, phase = phase.as_str(), error = error; "stage failed");
            Self::require(conn, task_id)
        })
    }

    /// failed → waiting at the same phase, counting the retry
    pub fn retry_stage(conn: &Connection, task_id: i64, now: i64) -> Result<StageRecord> {
        atomically(conn, || {
            let current = Self::require(conn, task_id)?;
            let changed = conn.execute(
                "UPDATE stage_records
                 SET status = 'waiting', retry_count = retry_count + 1, started_ts = NULL,
                     finished_ts = NULL, modified_ts = ?2
                 WHERE task_id = ?1 AND status = 'failed'",
                rusqlite::params![task_id, now],
            )?;
            if changed == 0 {
                return Err(StageError::IllegalTransition {
                    task_id,
                    phase: current.phase,
                    from: current.status,
                    to: StageStatus::Waiting,
                });
            }
            let detail = format!("retry {}", current.retry_count + 1);
            Self::note(
                conn,
                task_id,
                current.phase,
                Some(StageStatus::Failed),
                StageStatus::Waiting,
                Some(&detail),
                now,
            )?;
            Self::require(conn, task_id)
        })
    }

    /// processing → waiting without counting a retry (lock contended)
    pub fn requeue(conn: &Connection, task_id: i64, phase: Phase, now: i64) -> Result<StageRecord> {
        atomically(conn, || {
            let changed = conn.execute(
                "UPDATE stage_records
                 SET status = 'waiting', started_ts = NULL, modified_ts = ?3
                 WHERE task_id = ?1 AND phase = ?2 AND status = 'processing'",
                rusqlite::params![task_id, phase, now],
            )?;
            if changed == 0 {
                return Err(Self::illegal(conn, task_id, StageStatus::Waiting));
            }
            Self::note(
                conn,
                task_id,
                phase,
                Some(StageStatus::Processing),
                StageStatus::Waiting,
                Some("requeued"),
                now,
            )?;
            Self::require(conn, task_id)
        })
    }

    /// waiting | processing → cancelled
    pub fn cancel(conn: &Connection, task_id: i64, now: i64) -> Result<StageRecord> {
        atomically(conn, || {
            let current = Self::require(conn, task_id)?;
            if !current.status.is_cancellable() {
                return Err(Self::illegal(conn, task_id, StageStatus::Cancelled));
            }
            let changed = conn.execute(
                "UPDATE stage_records
                 SET status = 'cancelled', finished_ts = ?3, modified_ts = ?3
                 WHERE task_id = ?1 AND status = ?2",
                rusqlite::params![task_id, current.status, now],
            )?;
            if changed == 0 {
                return Err(Self::illegal(conn, task_id, StageStatus::Cancelled));
            }
            Self::note(
                conn,
                task_id,
                current.phase,
                Some(current.status),
                StageStatus::Cancelled,
                None,
                now,
            )?;
            Self::require(conn, task_id)
        })
    }

    /// Oldest waiting record of a phase. Schedule records only count once
    /// their task's scheduled time has arrived.
    pub fn next_waiting(conn: &Connection, phase: Phase, now: i64) -> Result<Option<StageRecord>> {
        let sql = format!(
            "{} JOIN tasks t ON t.id = r.task_id
             WHERE r.phase = ?1 AND r.status = 'waiting'
               AND (r.phase != 'schedule' OR t.scheduled_ts <= ?2)
             ORDER BY r.created_ts, r.task_id
             LIMIT 1",
            SELECT_RECORD
        );
        Ok(conn
            .query_row(&sql, rusqlite::params![phase, now], map_record)
            .optional()?)
    }

    pub fn list_by_status(conn: &Connection, status: StageStatus) -> Result<Vec<StageRecord>> {
        let sql = format!("{} WHERE r.status = ?1 ORDER BY r.task_id", SELECT_RECORD);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([status], map_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Per-phase counts, cancelled excluded, plus an overall total row
    pub fn summary(conn: &Connection) -> Result<Vec<PhaseSummary>> {
        let mut stmt = conn.prepare(
            "SELECT phase, status, COUNT(*) FROM stage_records
             WHERE status != 'cancelled'
             GROUP BY phase, status",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, Phase>(0)?,
                row.get::<_, StageStatus>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut per_phase: Vec<PhaseSummary> = Phase::ALL
            .iter()
            .map(|p| PhaseSummary {
                phase: Some(*p),
                ..Default::default()
            })
            .collect();
        let mut total = PhaseSummary::default();
        for row in rows {
            let (phase, status, count) = row?;
            let idx = Phase::ALL.iter().position(|p| *p == phase).unwrap_or(0);
            for entry in [&mut per_phase[idx], &mut total] {
                match status {
                    StageStatus::Waiting => entry.waiting += count,
                    StageStatus::Processing => entry.processing += count,
                    StageStatus::Completed => entry.completed += count,
                    StageStatus::Failed => entry.failed += count,
                    StageStatus::Cancelled => {}
                }
            }
        }
        per_phase.push(total);
        Ok(per_phase)
    }

    /// Number of waiting records of the same phase queued ahead of this task
    pub fn position(conn: &Connection, task_id: i64) -> Result<Option<i64>> {
        let record = Self::require(conn, task_id)?;
        if record.status != StageStatus::Waiting {
            return Ok(None);
        }
        let ahead: i64 = conn.query_row(
            "SELECT COUNT(*) FROM stage_records
             WHERE phase = ?1 AND status = 'waiting'
               AND (created_ts < ?2 OR (created_ts = ?2 AND task_id < ?3))",
            rusqlite::params![record.phase, record.created_ts, task_id],
            |row| row.get(0),
        )?;
        Ok(Some(ahead))
    }

    /// Processing records started more than `threshold_secs` ago
    pub fn stuck(conn: &Connection, threshold_secs: i64, now: i64) -> Result<Vec<StageRecord>> {
        let sql = format!(
            "{} WHERE r.status = 'processing' AND r.started_ts IS NOT NULL AND r.started_ts <= ?1
             ORDER BY r.started_ts",
            SELECT_RECORD
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([now - threshold_secs], map_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Fail processing records, all of them or only those started before
    /// `started_before`. Returns the affected task ids.
    pub fn fail_processing(
        conn: &Connection,
        started_before: Option<i64>,
        reason: &str,
        now: i64,
    ) -> Result<Vec<i64>> {
        let candidates = match started_before {
            Some(cutoff) => Self::stuck(conn, now - cutoff, now)?,
            None => Self::list_by_status(conn, StageStatus::Processing)?,
        };
        let mut failed = Vec::new();
        for record in candidates {
            match Self::fail_stage(conn, record.task_id, record.phase, reason, now) {
                Ok(_) => failed.push(record.task_id),
                // Moved on concurrently; nothing to recover
                Err(StageError::IllegalTransition { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(failed)
    }

    /// Completed records sitting on a non-terminal phase
    pub fn defective(conn: &Connection) -> Result<Vec<StageRecord>> {
        let sql = format!(
            "{} WHERE r.status = 'completed' AND r.phase != 'youtube' ORDER BY r.task_id",
            SELECT_RECORD
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], map_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Rewrite a defective completed record to next phase, waiting
    pub fn repair(conn: &Connection, record: &StageRecord, now: i64) -> Result<bool> {
        let (next_phase, next_status) = record.advanced();
        if next_phase == record.phase {
            return Ok(false);
        }
        atomically(conn, || {
            let changed = conn.execute(
                "UPDATE stage_records
                 SET phase = ?3, status = ?4, started_ts = NULL, finished_ts = NULL,
                     retry_count = 0, modified_ts = ?5
                 WHERE task_id = ?1 AND phase = ?2 AND status = 'completed'",
                rusqlite::params![record.task_id, record.phase, next_phase, next_status, now],
            )?;
            if changed == 0 {
                return Ok(false);
            }
            let detail = format!("repaired completed {}", record.phase);
            Self::note(
                conn,
                record.task_id,
                next_phase,
                Some(StageStatus::Completed),
                next_status,
                Some(&detail),
                now,
            )?;
            Ok(true)
        })
    }

    /// Delete finished tasks (completed, failed or cancelled) untouched since
    /// `cutoff`, with their records, logs and events
    pub fn cleanup(conn: &Connection, cutoff: i64) -> Result<usize> {
        let deleted = conn.execute(
            "DELETE FROM tasks WHERE id IN (
                SELECT task_id FROM stage_records
                WHERE status IN ('completed', 'failed', 'cancelled') AND modified_ts < ?1
             )",
            [cutoff],
        )?;
        if deleted > 0 {
            info!(deleted = deleted; "cleaned up finished tasks");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbConnection;
    use crate::models::Task;
    use crate::repo::{EventRepo, StageLogRepo, TaskRepo};

    fn setup() -> (Connection, i64) {
        let conn = DbConnection::connect_in_memory().unwrap();
        let task = TaskRepo::create_scheduled(&conn, Task::new("o", "c", "t", 100, 100), 100).unwrap();
        (conn, task.id.unwrap())
    }

    fn run_phase(conn: &Connection, id: i64, phase: Phase, now: i64) -> StageRecord {
        match StageRepo::acquire_stage(conn, id, phase, now).unwrap() {
            AcquireOutcome::Acquired(r) => assert_eq!(r.status, StageStatus::Processing),
            other => panic!("expected acquire, got {:?}", other),
        }
        StageRepo::complete_stage(conn, id, phase, now + 1).unwrap()
    }

    #[test]
    fn test_new_task_starts_waiting_at_schedule() {
        let (conn, id) = setup();
        let record = StageRepo::require(&conn, id).unwrap();
        assert_eq!(record.phase, Phase::Schedule);
        assert_eq!(record.status, StageStatus::Waiting);
    }

    #[test]
    fn test_acquire_is_idempotent() {
        let (conn, id) = setup();
        let first = StageRepo::acquire_stage(&conn, id, Phase::Schedule, 200).unwrap();
        assert!(matches!(first, AcquireOutcome::Acquired(_)));

        let second = StageRepo::acquire_stage(&conn, id, Phase::Schedule, 201).unwrap();
        match second {
            AcquireOutcome::NotEligible { current } => {
                assert_eq!(current.status, StageStatus::Processing)
            }
            other => panic!("expected NotEligible, got {:?}", other),
        }
    }

    #[test]
    fn test_acquire_wrong_phase_not_eligible() {
        let (conn, id) = setup();
        let outcome = StageRepo::acquire_stage(&conn, id, Phase::Image, 200).unwrap();
        assert!(matches!(outcome, AcquireOutcome::NotEligible { .. }));
    }

    #[test]
    fn test_acquire_unknown_task() {
        let (conn, _) = setup();
        let err = StageRepo::acquire_stage(&conn, 999, Phase::Schedule, 200).unwrap_err();
        assert!(matches!(err, StageError::TaskNotFound(999)));
    }

    #[test]
    fn test_script_completion_moves_to_image_waiting() {
        let (conn, id) = setup();
        run_phase(&conn, id, Phase::Schedule, 200);
        let record = run_phase(&conn, id, Phase::Script, 300);
        assert_eq!(record.phase, Phase::Image);
        assert_eq!(record.status, StageStatus::Waiting);
        assert!(record.started_ts.is_none());

        let task = TaskRepo::get_by_id(&conn, id).unwrap().unwrap();
        assert!(!task.done);
    }

    #[test]
    fn test_full_pipeline_marks_task_done() {
        let (conn, id) = setup();
        let mut now = 200;
        let mut last = None;
        for phase in Phase::ALL {
            last = Some(run_phase(&conn, id, phase, now));
            now += 100;
        }
        let last = last.unwrap();
        assert_eq!(last.phase, Phase::Youtube);
        assert_eq!(last.status, StageStatus::Completed);

        let task = TaskRepo::get_by_id(&conn, id).unwrap().unwrap();
        assert!(task.done);
        assert!(task.done_ts.is_some());

        // Terminal: nothing more can be acquired
        let again = StageRepo::acquire_stage(&conn, id, Phase::Youtube, now).unwrap();
        assert!(matches!(again, AcquireOutcome::NotEligible { .. }));

        // Exactly one record throughout
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM stage_records WHERE task_id = ?1", [id], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_complete_requires_processing() {
        let (conn, id) = setup();
        let err = StageRepo::complete_stage(&conn, id, Phase::Schedule, 200).unwrap_err();
        match err {
            StageError::IllegalTransition { from, to, .. } => {
                assert_eq!(from, StageStatus::Waiting);
                assert_eq!(to, StageStatus::Completed);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_fail_then_retry() {
        let (conn, id) = setup();
        StageRepo::acquire_stage(&conn, id, Phase::Schedule, 200).unwrap();
        let failed = StageRepo::fail_stage(&conn, id, Phase::Schedule, "network down", 210).unwrap();
        assert_eq!(failed.status, StageStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("network down"));

        let retried = StageRepo::retry_stage(&conn, id, 220).unwrap();
        assert_eq!(retried.phase, Phase::Schedule);
        assert_eq!(retried.status, StageStatus::Waiting);
        assert_eq!(retried.retry_count, 1);

        // Only failed records can be retried
        assert!(StageRepo::retry_stage(&conn, id, 230).is_err());
    }

    #[test]
    fn test_cancel_only_from_waiting_or_processing() {
        let (conn, id) = setup();
        let cancelled = StageRepo::cancel(&conn, id, 200).unwrap();
        assert_eq!(cancelled.status, StageStatus::Cancelled);

        let err = StageRepo::cancel(&conn, id, 210).unwrap_err();
        assert!(matches!(err, StageError::IllegalTransition { .. }));

        let (conn, id) = setup();
        StageRepo::acquire_stage(&conn, id, Phase::Schedule, 200).unwrap();
        StageRepo::fail_stage(&conn, id, Phase::Schedule, "boom", 210).unwrap();
        assert!(StageRepo::cancel(&conn, id, 220).is_err());
    }

    #[test]
    fn test_requeue_returns_to_waiting() {
        let (conn, id) = setup();
        StageRepo::acquire_stage(&conn, id, Phase::Schedule, 200).unwrap();
        let record = StageRepo::requeue(&conn, id, Phase::Schedule, 201).unwrap();
        assert_eq!(record.status, StageStatus::Waiting);
        assert_eq!(record.retry_count, 0);
    }

    #[test]
    fn test_transitions_emit_events_and_log_lines() {
        let (conn, id) = setup();
        run_phase(&conn, id, Phase::Schedule, 200);
        let events = EventRepo::list_for_task(&conn, id).unwrap();
        let tos: Vec<StageStatus> = events.iter().map(|e| e.to_status).collect();
        assert_eq!(
            tos,
            vec![
                StageStatus::Waiting,
                StageStatus::Processing,
                StageStatus::Completed,
                StageStatus::Waiting
            ]
        );
        let lines = StageLogRepo::lines(&conn, id, Phase::Schedule).unwrap();
        assert_eq!(lines.last().map(String::as_str), Some("stage schedule processing -> completed"));
    }

    #[test]
    fn test_next_waiting_respects_schedule_time() {
        let conn = DbConnection::connect_in_memory().unwrap();
        let later = TaskRepo::create_scheduled(&conn, Task::new("o", "c", "later", 5_000, 100), 100).unwrap();
        let soon = TaskRepo::create_scheduled(&conn, Task::new("o", "c", "soon", 1_000, 110), 110).unwrap();

        let next = StageRepo::next_waiting(&conn, Phase::Schedule, 2_000).unwrap().unwrap();
        assert_eq!(next.task_id, soon.id.unwrap());

        let next = StageRepo::next_waiting(&conn, Phase::Schedule, 6_000).unwrap().unwrap();
        assert_eq!(next.task_id, later.id.unwrap());

        assert!(StageRepo::next_waiting(&conn, Phase::Schedule, 500).unwrap().is_none());
    }

    #[test]
    fn test_summary_position_and_stuck() {
        let conn = DbConnection::connect_in_memory().unwrap();
        let a = TaskRepo::create_scheduled(&conn, Task::new("o", "c", "a", 0, 100), 100).unwrap().id.unwrap();
        let b = TaskRepo::create_scheduled(&conn, Task::new("o", "c", "b", 0, 110), 110).unwrap().id.unwrap();
        let c = TaskRepo::create_scheduled(&conn, Task::new("o", "c", "c", 0, 120), 120).unwrap().id.unwrap();
        StageRepo::cancel(&conn, c, 130).unwrap();

        assert_eq!(StageRepo::position(&conn, a).unwrap(), Some(0));
        assert_eq!(StageRepo::position(&conn, b).unwrap(), Some(1));

        StageRepo::acquire_stage(&conn, a, Phase::Schedule, 200).unwrap();
        let summary = StageRepo::summary(&conn).unwrap();
        let schedule = &summary[0];
        assert_eq!(schedule.phase, Some(Phase::Schedule));
        assert_eq!(schedule.waiting, 1);
        assert_eq!(schedule.processing, 1);
        let total = summary.last().unwrap();
        assert_eq!(total.phase, None);
        assert_eq!(total.waiting + total.processing, 2);

        assert!(StageRepo::stuck(&conn, 600, 700).unwrap().is_empty());
        let stuck = StageRepo::stuck(&conn, 600, 800).unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].task_id, a);
    }

    #[test]
    fn test_defect_repair() {
        let (conn, id) = setup();
        conn.execute(
            "UPDATE stage_records SET phase = 'script', status = 'completed' WHERE task_id = ?1",
            [id],
        )
        .unwrap();
        let defective = StageRepo::defective(&conn).unwrap();
        assert_eq!(defective.len(), 1);
        assert!(StageRepo::repair(&conn, &defective[0], 300).unwrap());

        let record = StageRepo::require(&conn, id).unwrap();
        assert_eq!((record.phase, record.status), (Phase::Image, StageStatus::Waiting));
        assert!(StageRepo::defective(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_cleanup_removes_old_finished_tasks() {
        let (conn, id) = setup();
        StageRepo::cancel(&conn, id, 200).unwrap();
        let keep = TaskRepo::create_scheduled(&conn, Task::new("o", "c", "keep", 0, 100), 100).unwrap();

        assert_eq!(StageRepo::cleanup(&conn, 150).unwrap(), 0);
        assert_eq!(StageRepo::cleanup(&conn, 1_000).unwrap(), 1);
        assert!(StageRepo::get(&conn, id).unwrap().is_none());
        assert!(StageRepo::get(&conn, keep.id.unwrap()).unwrap().is_some());
        assert!(StageLogRepo::lines(&conn, id, Phase::Schedule).unwrap().is_empty());
    }
}
