//! Global per-phase lock registry
//!
//! One row per phase kind. A null holder means free. Acquisition is a
//! compare-and-swap on the holder column; a holder older than the phase
//! timeout is treated as a crashed worker and replaced.

use log::{info, warn};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::config::LockTimeouts;
use crate::error::{Result, StageError};
use crate::models::{LockGrant, Phase, StageLock};

/// A concurrent writer can change the row between our read and our CAS; give
/// up after this many rounds instead of spinning
const MAX_CAS_ROUNDS: usize = 3;

fn map_lock(row: &Row) -> rusqlite::Result<StageLock> {
    Ok(StageLock {
        kind: row.get(0)?,
        holder_task_id: row.get(1)?,
        acquired_ts: row.get(2)?,
        owner_pid: row.get(3)?,
    })
}

pub struct LockRepo;

impl LockRepo {
    pub fn get(conn: &Connection, kind: Phase) -> Result<StageLock> {
        let lock = conn
            .query_row(
                "SELECT kind, holder_task_id, acquired_ts, owner_pid FROM stage_locks WHERE kind = ?1",
                [kind],
                map_lock,
            )
            .optional()?;
        // Rows are seeded by the migration; a missing one is an unusable store
        lock.ok_or(StageError::Storage(rusqlite::Error::QueryReturnedNoRows))
    }

    pub fn list(conn: &Connection) -> Result<Vec<StageLock>> {
        let mut stmt = conn.prepare(
            "SELECT kind, holder_task_id, acquired_ts, owner_pid FROM stage_locks",
        )?;
        let rows = stmt.query_map([], map_lock)?;
        let mut locks = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        locks.sort_by_key(|l| l.kind);
        Ok(locks)
    }

    /// Try to take the `kind` lock for `task_id`. Never blocks.
    ///
    /// Fails with `RetryLater` while a live holder has it. A holder whose
    /// age reached `timeout_secs` is replaced and a warning is logged.
    pub fn acquire(
        conn: &Connection,
        kind: Phase,
        task_id: i64,
        owner_pid: i64,
        timeout_secs: i64,
        now: i64,
    ) -> Result<LockGrant> {
        for _ in 0..MAX_CAS_ROUNDS {
            let taken = conn.execute(
                "UPDATE stage_locks SET holder_task_id = ?2, acquired_ts = ?3, owner_pid = ?4
                 WHERE kind = ?1 AND holder_task_id IS NULL",
                rusqlite::params![kind, task_id, now, owner_pid],
            )?;
            if taken == 1 {
                info!(kind = kind.as_str(), task = task_id; "lock acquired");
                return Ok(LockGrant::Fresh);
            }

            let current = Self::get(conn, kind)?;
            let (holder, acquired) = match (current.holder_task_id, current.acquired_ts) {
                (Some(holder), Some(acquired)) => (holder, acquired),
                // Freed between the two statements, or a holder without a
                // timestamp which can only be reclaimed by hand
                (None, _) => continue,
                (Some(holder), None) => {
                    return Err(StageError::RetryLater {
                        kind,
                        holder,
                        age_secs: 0,
                    })
                }
            };

            let age_secs = (now - acquired).max(0);
            if holder != task_id && age_secs < timeout_secs {
                return Err(StageError::RetryLater {
                    kind,
                    holder,
                    age_secs,
                });
            }

            let swapped = conn.execute(
                "UPDATE stage_locks SET holder_task_id = ?4, acquired_ts = ?5, owner_pid = ?6
                 WHERE kind = ?1 AND holder_task_id = ?2 AND acquired_ts = ?3",
                rusqlite::params![kind, holder, acquired, task_id, now, owner_pid],
            )?;
            if swapped == 1 {
                if holder == task_id {
                    info!(kind = kind.as_str(), task = task_id; "lock re-acquired by its holder");
                    return Ok(LockGrant::Fresh);
                }
                warn!(
                    kind = kind.as_str(),
                    task = task_id,
                    previous = holder,
                    age_secs = age_secs;
                    "stale lock reclaimed"
                );
                return Ok(LockGrant::Reclaimed { previous: holder });
            }
        }

        let current = Self::get(conn, kind)?;
        Err(StageError::RetryLater {
            kind,
            holder: current.holder_task_id.unwrap_or_default(),
            age_secs: current.age_secs(now).unwrap_or_default(),
        })
    }

    /// Clear the lock only if `task_id` holds it
    pub fn release(conn: &Connection, kind: Phase, task_id: i64) -> Result<bool> {
        let released = conn.execute(
            "UPDATE stage_locks SET holder_task_id = NULL, acquired_ts = NULL, owner_pid = NULL
             WHERE kind = ?1 AND holder_task_id = ?2",
            rusqlite::params![kind, task_id],
        )?;
        if released == 1 {
            info!(kind = kind.as_str(), task = task_id; "lock released");
        }
        Ok(released == 1)
    }

    /// Administrative release regardless of holder. Returns the previous holder.
    pub fn force_release(conn: &Connection, kind: Phase) -> Result<Option<i64>> {
        let current = Self::get(conn, kind)?;
        let Some(holder) = current.holder_task_id else {
            return Ok(None);
        };
        if Self::release(conn, kind, holder)? {
            warn!(kind = kind.as_str(), previous = holder; "lock force-released");
            Ok(Some(holder))
        } else {
            Ok(None)
        }
    }

    /// Release every lock held longer than its timeout
    pub fn release_stale(conn: &Connection, timeouts: &LockTimeouts, now: i64) -> Result<Vec<(Phase, i64)>> {
        let mut released = Vec::new();
        for lock in Self::list(conn)? {
            let (Some(holder), Some(age)) = (lock.holder_task_id, lock.age_secs(now)) else {
                continue;
            };
            if age < timeouts.for_phase(lock.kind) {
                continue;
            }
            let cleared = conn.execute(
                "UPDATE stage_locks SET holder_task_id = NULL, acquired_ts = NULL, owner_pid = NULL
                 WHERE kind = ?1 AND holder_task_id = ?2 AND acquired_ts = ?3",
                rusqlite::params![lock.kind, holder, lock.acquired_ts],
            )?;
            if cleared == 1 {
                warn!(kind = lock.kind.as_str(), previous = holder, age_secs = age; "stale lock released");
                released.push((lock.kind, holder));
            }
        }
        Ok(released)
    }

    /// Free every lock; used at startup when no worker can be alive
    pub fn release_all(conn: &Connection) -> Result<usize> {
        let released = conn.execute(
            "UPDATE stage_locks SET holder_task_id = NULL, acquired_ts = NULL, owner_pid = NULL
             WHERE holder_task_id IS NOT NULL",
            [],
        )?;
        Ok(released)
    }
}
