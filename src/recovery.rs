//! Startup and periodic recovery of interrupted work

use std::collections::HashMap;

use anyhow::Result;
use log::{error, info, warn};
use rusqlite::Connection;
use serde::Serialize;

use crate::config::LockTimeouts;
use crate::repo::{LockRepo, StageRepo};

pub const RESTART_REASON: &str = "interrupted by restart";
pub const STALE_REASON: &str = "processing timed out";

/// What a recovery pass changed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub locks_released: usize,
    pub stages_failed: Vec<i64>,
    pub stages_repaired: Vec<i64>,
}

/// No worker survives a restart: free every lock and fail every record that
/// was being processed
pub fn recover_on_startup(conn: &Connection, now: i64) -> Result<RecoveryReport> {
    let tx = conn.unchecked_transaction()?;
    let locks_released = LockRepo::release_all(&tx)?;
    let stages_failed = StageRepo::fail_processing(&tx, None, RESTART_REASON, now)?;
    tx.commit()?;

    if locks_released > 0 || !stages_failed.is_empty() {
        warn!(locks = locks_released, stages = stages_failed.len(); "recovered interrupted work");
    }
    Ok(RecoveryReport {
        locks_released,
        stages_failed,
        ..Default::default()
    })
}

/// Fail records processing for at least `threshold_secs` and release locks
/// held that long
pub fn recover_stale(conn: &Connection, threshold_secs: i64, now: i64) -> Result<RecoveryReport> {
    let timeouts = LockTimeouts {
        default_secs: threshold_secs,
        per_phase: HashMap::new(),
    };
    let tx = conn.unchecked_transaction()?;
    let stages_failed = StageRepo::fail_processing(&tx, Some(now - threshold_secs), STALE_REASON, now)?;
    let released = LockRepo::release_stale(&tx, &timeouts, now)?;
    tx.commit()?;

    if !stages_failed.is_empty() {
        warn!(stages = stages_failed.len(), threshold_secs = threshold_secs; "stale stages failed");
    }
    Ok(RecoveryReport {
        locks_released: released.len(),
        stages_failed,
        ..Default::default()
    })
}

/// Rewrite completed records left on a non-terminal phase to the next phase
pub fn repair_defects(conn: &Connection, now: i64) -> Result<RecoveryReport> {
    let mut repaired = Vec::new();
    for record in StageRepo::defective(conn)? {
        error!(task = record.task_id, phase = record.phase.as_str();
            "completed record on a non-terminal phase");
        if StageRepo::repair(conn, &record, now)? {
            repaired.push(record.task_id);
        }
    }
    if !repaired.is_empty() {
        info!(repaired = repaired.len(); "defective stage records repaired");
    }
    Ok(RecoveryReport {
        stages_repaired: repaired,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbConnection;
    use crate::models::{Phase, StageStatus, Task};
    use crate::repo::TaskRepo;

    fn processing_task(conn: &Connection, started: i64) -> i64 {
        let task = TaskRepo::create_scheduled(conn, Task::new("o", "c", "t", 0, 0), 0).unwrap();
        let id = task.id.unwrap();
        StageRepo::acquire_stage(conn, id, Phase::Schedule, started).unwrap();
        id
    }

    #[test]
    fn test_startup_fails_processing_and_frees_locks() {
        let conn = DbConnection::connect_in_memory().unwrap();
        let busy = processing_task(&conn, 100);
        LockRepo::acquire(&conn, Phase::Schedule, busy, 1, 600, 100).unwrap();
        let idle = TaskRepo::create_scheduled(&conn, Task::new("o", "c", "u", 0, 0), 0)
            .unwrap()
            .id
            .unwrap();

        let report = recover_on_startup(&conn, 200).unwrap();
        assert_eq!(report.locks_released, 1);
        assert_eq!(report.stages_failed, vec![busy]);

        let record = StageRepo::require(&conn, busy).unwrap();
        assert_eq!(record.status, StageStatus::Failed);
        assert_eq!(record.error.as_deref(), Some(RESTART_REASON));
        assert_eq!(StageRepo::require(&conn, idle).unwrap().status, StageStatus::Waiting);
        assert!(LockRepo::get(&conn, Phase::Schedule).unwrap().is_free());
    }

    #[test]
    fn test_stale_only_touches_old_work() {
        let conn = DbConnection::connect_in_memory().unwrap();
        let old = processing_task(&conn, 100);
        let fresh = processing_task(&conn, 900);
        LockRepo::acquire(&conn, Phase::Script, old, 1, 600, 100).unwrap();
        LockRepo::acquire(&conn, Phase::Image, fresh, 1, 600, 900).unwrap();

        let report = recover_stale(&conn, 600, 1_000).unwrap();
        assert_eq!(report.stages_failed, vec![old]);
        assert_eq!(report.locks_released, 1);
        assert_eq!(StageRepo::require(&conn, fresh).unwrap().status, StageStatus::Processing);
        assert!(LockRepo::get(&conn, Phase::Script).unwrap().is_free());
        assert_eq!(LockRepo::get(&conn, Phase::Image).unwrap().holder_task_id, Some(fresh));
    }

    #[test]
    fn test_repair_defects() {
        let conn = DbConnection::connect_in_memory().unwrap();
        let id = processing_task(&conn, 100);
        conn.execute(
            "UPDATE stage_records SET phase = 'image', status = 'completed' WHERE task_id = ?1",
            [id],
        )
        .unwrap();

        let report = repair_defects(&conn, 200).unwrap();
        assert_eq!(report.stages_repaired, vec![id]);
        let record = StageRepo::require(&conn, id).unwrap();
        assert_eq!(record.phase, Phase::Video);
        assert_eq!(record.status, StageStatus::Waiting);
        assert!(repair_defects(&conn, 300).unwrap().stages_repaired.is_empty());
    }
}
