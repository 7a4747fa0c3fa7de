//! Claim/retry/give-up queue of classified failures
//!
//! Entries are deduplicated by hash. A handler claims the most urgent pending
//! entry, and either resolves it or records a failed attempt; after
//! `max_retries` attempts the entry is parked as failed. Claims that are never
//! finished are swept back to pending.

use std::collections::BTreeMap;

use anyhow::Result;
use log::{debug, info, warn};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::models::{error_hash, ErrorRecord, ErrorStatus, Phase, Severity};

const SELECT_ERROR: &str = "SELECT id, error_hash, kind, message, context, severity, status, task_id,
        phase, claimed_by, claimed_ts, retry_count, resolution, created_ts, updated_ts
     FROM error_records";

fn map_error(row: &Row) -> rusqlite::Result<ErrorRecord> {
    Ok(ErrorRecord {
        id: row.get(0)?,
        error_hash: row.get(1)?,
        kind: row.get(2)?,
        message: row.get(3)?,
        context: row.get(4)?,
        severity: row.get(5)?,
        status: row.get(6)?,
        task_id: row.get(7)?,
        phase: row.get(8)?,
        claimed_by: row.get(9)?,
        claimed_ts: row.get(10)?,
        retry_count: row.get(11)?,
        resolution: row.get(12)?,
        created_ts: row.get(13)?,
        updated_ts: row.get(14)?,
    })
}

/// A failure to be recorded
#[derive(Debug, Clone)]
pub struct NewError<'a> {
    pub kind: &'a str,
    pub message: &'a str,
    pub context: Option<&'a str>,
    pub severity: Severity,
    pub task_id: Option<i64>,
    pub phase: Option<Phase>,
}

/// Result of recording a failed handling attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub retry_count: i64,
    pub gave_up: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorStats {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub pending_by_severity: BTreeMap<String, i64>,
    pub pending_by_kind: BTreeMap<String, i64>,
}

pub struct ErrorLedgerRepo;

impl ErrorLedgerRepo {
    /// Record a failure. Returns `None` when the same hash is already known.
    pub fn report(conn: &Connection, error: &NewError, now: i64) -> Result<Option<ErrorRecord>> {
        let hash = error_hash(error.kind, error.message, error.context);
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO error_records (error_hash, kind, message, context, severity, status,
                    task_id, phase, retry_count, created_ts, updated_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, 0, ?8, ?8)",
            rusqlite::params![
                hash,
                error.kind,
                error.message,
                error.context,
                error.severity,
                error.task_id,
                error.phase,
                now
            ],
        )?;
        if inserted == 0 {
            debug!(kind = error.kind, hash = hash.as_str(); "duplicate error ignored");
            return Ok(None);
        }
        let id = conn.last_insert_rowid();
        info!(id = id, kind = error.kind, severity = error.severity.as_str(); "error recorded");
        Self::get(conn, id)
    }

    pub fn get(conn: &Connection, id: i64) -> Result<Option<ErrorRecord>> {
        let sql = format!("{} WHERE id = ?1", SELECT_ERROR);
        Ok(conn.query_row(&sql, [id], map_error).optional()?)
    }

    pub fn list(conn: &Connection, status: Option<ErrorStatus>, limit: usize) -> Result<Vec<ErrorRecord>> {
        let sql = format!(
            "{} WHERE (?1 IS NULL OR status = ?1) ORDER BY id DESC LIMIT ?2",
            SELECT_ERROR
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![status, limit as i64], map_error)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Claim the most urgent pending entry: critical first, then oldest
    pub fn claim(conn: &Connection, worker: &str, now: i64) -> Result<Option<ErrorRecord>> {
        for _ in 0..3 {
            let id: Option<i64> = conn
                .query_row(
                    "SELECT id FROM error_records WHERE status = 'pending'
                     ORDER BY CASE severity WHEN 'critical' THEN 1 WHEN 'error' THEN 2 ELSE 3 END,
                              created_ts, id
                     LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(id) = id else {
                return Ok(None);
            };
            let claimed = conn.execute(
                "UPDATE error_records SET status = 'claimed', claimed_by = ?2, claimed_ts = ?3, updated_ts = ?3
                 WHERE id = ?1 AND status = 'pending'",
                rusqlite::params![id, worker, now],
            )?;
            if claimed == 1 {
                return Self::get(conn, id);
            }
        }
        Ok(None)
    }

    /// claimed → processing, only by the claimer
    pub fn start(conn: &Connection, id: i64, worker: &str, now: i64) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE error_records SET status = 'processing', updated_ts = ?3
             WHERE id = ?1 AND status = 'claimed' AND claimed_by = ?2",
            rusqlite::params![id, worker, now],
        )?;
        Ok(changed == 1)
    }

    fn close(conn: &Connection, id: i64, status: ErrorStatus, note: Option<&str>, now: i64) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE error_records SET status = ?2, resolution = COALESCE(?3, resolution), updated_ts = ?4
             WHERE id = ?1 AND status IN ('pending', 'claimed', 'processing')",
            rusqlite::params![id, status, note, now],
        )?;
        Ok(changed == 1)
    }

    pub fn resolve(conn: &Connection, id: i64, resolution: &str, now: i64) -> Result<bool> {
        Self::close(conn, id, ErrorStatus::Resolved, Some(resolution), now)
    }

    pub fn ignore(conn: &Connection, id: i64, now: i64) -> Result<bool> {
        Self::close(conn, id, ErrorStatus::Ignored, None, now)
    }

    /// Count a failed handling attempt. Below `max_retries` the entry goes
    /// back to pending; at `max_retries` it is parked as failed.
    pub fn record_attempt_failure(
        conn: &Connection,
        id: i64,
        max_retries: i64,
        now: i64,
    ) -> Result<AttemptOutcome> {
        let changed = conn.execute(
            "UPDATE error_records
             SET retry_count = retry_count + 1,
                 status = CASE WHEN retry_count + 1 >= ?2 THEN 'failed' ELSE 'pending' END,
                 claimed_by = NULL, claimed_ts = NULL, updated_ts = ?3
             WHERE id = ?1 AND status IN ('pending', 'claimed', 'processing')",
            rusqlite::params![id, max_retries, now],
        )?;
        if changed == 0 {
            anyhow::bail!("Error {} is not open", id);
        }
        let record = Self::get(conn, id)?.ok_or_else(|| anyhow::anyhow!("Error {} not found", id))?;
        let gave_up = record.status == ErrorStatus::Failed;
        if gave_up {
            warn!(id = id, retries = record.retry_count; "error handling gave up");
        }
        Ok(AttemptOutcome {
            retry_count: record.retry_count,
            gave_up,
        })
    }

    /// Return claims untouched for `timeout_secs` to pending
    pub fn recover_stuck(conn: &Connection, timeout_secs: i64, now: i64) -> Result<usize> {
        let recovered = conn.execute(
            "UPDATE error_records SET status = 'pending', claimed_by = NULL, claimed_ts = NULL, updated_ts = ?1
             WHERE status IN ('claimed', 'processing') AND updated_ts < ?2",
            rusqlite::params![now, now - timeout_secs],
        )?;
        if recovered > 0 {
            warn!(count = recovered, timeout_secs = timeout_secs; "stuck error claims returned to pending");
        }
        Ok(recovered)
    }

    pub fn stats(conn: &Connection) -> Result<ErrorStats> {
        let mut stats = ErrorStats::default();

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM error_records GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, count) = row?;
            stats.total += count;
            stats.by_status.insert(status, count);
        }

        let mut stmt = conn.prepare(
            "SELECT severity, COUNT(*) FROM error_records WHERE status = 'pending' GROUP BY severity",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (severity, count) = row?;
            stats.pending_by_severity.insert(severity, count);
        }

        let mut stmt = conn.prepare(
            "SELECT kind, COUNT(*) FROM error_records WHERE status = 'pending'
             GROUP BY kind ORDER BY COUNT(*) DESC LIMIT 10",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (kind, count) = row?;
            stats.pending_by_kind.insert(kind, count);
        }

        Ok(stats)
    }
}
