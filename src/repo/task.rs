use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::models::{Phase, StageRecord, StageStatus, Task};
use crate::repo::{atomically, StageRepo};

const SELECT_TASK: &str = "SELECT t.id, t.uuid, t.owner, t.channel, t.category, t.title, t.content_id,
        t.scheduled_ts, t.expected_total, t.done, t.done_ts, t.created_ts, t.modified_ts
     FROM tasks t";

fn map_task(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: Some(row.get(0)?),
        uuid: row.get(1)?,
        owner: row.get(2)?,
        channel: row.get(3)?,
        category: row.get(4)?,
        title: row.get(5)?,
        content_id: row.get(6)?,
        scheduled_ts: row.get(7)?,
        expected_total: row.get(8)?,
        done: row.get(9)?,
        done_ts: row.get(10)?,
        created_ts: row.get(11)?,
        modified_ts: row.get(12)?,
    })
}

/// Start of the minute containing `ts`
pub fn minute_floor(ts: i64) -> i64 {
    ts.div_euclid(60) * 60
}

/// Narrowing options for [`TaskRepo::list`]
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub owner: Option<String>,
    pub channel: Option<String>,
    pub phase: Option<Phase>,
    pub status: Option<StageStatus>,
    pub include_done: bool,
    pub limit: Option<usize>,
}

/// Task repository for database operations
pub struct TaskRepo;

impl TaskRepo {
    /// Insert a task and its initial stage record (schedule, waiting) as one unit
    pub fn create_scheduled(conn: &Connection, task: Task, now: i64) -> Result<Task> {
        atomically(conn, || {
            conn.execute(
                "INSERT INTO tasks (uuid, owner, channel, category, title, content_id, scheduled_ts,
                        expected_total, done, done_ts, created_ts, modified_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, NULL, ?9, ?9)",
                rusqlite::params![
                    task.uuid,
                    task.owner,
                    task.channel,
                    task.category,
                    task.title,
                    task.content_id,
                    task.scheduled_ts,
                    task.expected_total,
                    now
                ],
            )
            .with_context(|| format!("Failed to create task: {}", task.title))?;

            let id = conn.last_insert_rowid();
            StageRepo::create_initial(conn, id, now)
                .with_context(|| format!("Failed to queue task {}", id))?;

            Ok(Task {
                id: Some(id),
                created_ts: now,
                modified_ts: now,
                ..task
            })
        })
    }

    /// Get task by ID
    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<Task>> {
        let sql = format!("{} WHERE t.id = ?1", SELECT_TASK);
        let task = conn.query_row(&sql, [id], map_task).optional()?;
        Ok(task)
    }

    /// Tasks joined with their stage record, oldest first
    pub fn list(conn: &Connection, filter: &TaskFilter) -> Result<Vec<(Task, StageRecord)>> {
        let mut stmt = conn.prepare(
            "SELECT t.id, t.uuid, t.owner, t.channel, t.category, t.title, t.content_id,
                    t.scheduled_ts, t.expected_total, t.done, t.done_ts, t.created_ts, t.modified_ts,
                    r.phase, r.status, r.error, r.retry_count, r.created_ts, r.started_ts,
                    r.finished_ts, r.modified_ts
             FROM tasks t JOIN stage_records r ON r.task_id = t.id
             WHERE (?1 IS NULL OR t.owner = ?1)
               AND (?2 IS NULL OR t.channel = ?2)
               AND (?3 IS NULL OR r.phase = ?3)
               AND (?4 IS NULL OR r.status = ?4)
               AND (?5 OR t.done = 0)
             ORDER BY t.scheduled_ts, t.id
             LIMIT ?6",
        )?;
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(
            rusqlite::params![
                filter.owner,
                filter.channel,
                filter.phase,
                filter.status,
                filter.include_done,
                limit
            ],
            |row| {
                let task = map_task(row)?;
                let record = StageRecord {
                    task_id: row.get(0)?,
                    phase: row.get(13)?,
                    status: row.get(14)?,
                    error: row.get(15)?,
                    retry_count: row.get(16)?,
                    created_ts: row.get(17)?,
                    started_ts: row.get(18)?,
                    finished_ts: row.get(19)?,
                    modified_ts: row.get(20)?,
                };
                Ok((task, record))
            },
        )?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Whether a live (not cancelled) task of this channel is already booked
    /// in the same minute as `ts`
    pub fn exists_at_minute(conn: &Connection, owner: &str, channel: &str, ts: i64) -> Result<bool> {
        let start = minute_floor(ts);
        let found: Option<i64> = conn
            .query_row(
                "SELECT t.id FROM tasks t JOIN stage_records r ON r.task_id = t.id
                 WHERE t.owner = ?1 AND t.channel = ?2
                   AND t.scheduled_ts >= ?3 AND t.scheduled_ts < ?4
                   AND r.status != 'cancelled'
                 LIMIT 1",
                rusqlite::params![owner, channel, start, start + 60],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Minute starts already booked for a channel within `[from, to)`
    pub fn taken_minutes(
        conn: &Connection,
        owner: &str,
        channel: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<i64>> {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT (t.scheduled_ts / 60) * 60 FROM tasks t
             JOIN stage_records r ON r.task_id = t.id
             WHERE t.owner = ?1 AND t.channel = ?2
               AND t.scheduled_ts >= ?3 AND t.scheduled_ts < ?4
               AND r.status != 'cancelled'
             ORDER BY 1",
        )?;
        let rows = stmt.query_map(rusqlite::params![owner, channel, from, to], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
    }

    pub fn set_expected_total(conn: &Connection, id: i64, total: i64, now: i64) -> Result<()> {
        let changed = conn.execute(
            "UPDATE tasks SET expected_total = ?2, modified_ts = ?3 WHERE id = ?1",
            rusqlite::params![id, total, now],
        )?;
        if changed == 0 {
            anyhow::bail!("Task {} not found", id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbConnection;

    #[test]
    fn test_create_scheduled_queues_task() {
        let conn = DbConnection::connect_in_memory().unwrap();
        let mut task = Task::new("alice", "cooking", "Bread in ten minutes", 3_600, 100);
        task.category = Some("bread".to_string());
        let task = TaskRepo::create_scheduled(&conn, task, 100).unwrap();
        let id = task.id.unwrap();

        let loaded = TaskRepo::get_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(loaded.title, "Bread in ten minutes");
        assert_eq!(loaded.category.as_deref(), Some("bread"));

        let listed = TaskRepo::list(&conn, &TaskFilter::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1.phase, Phase::Schedule);
        assert_eq!(listed[0].1.status, StageStatus::Waiting);
    }

    #[test]
    fn test_exists_at_minute() {
        let conn = DbConnection::connect_in_memory().unwrap();
        // 10:00:30 of some day
        let ts = 1_704_103_230;
        TaskRepo::create_scheduled(&conn, Task::new("alice", "cooking", "a", ts, 100), 100).unwrap();

        assert!(TaskRepo::exists_at_minute(&conn, "alice", "cooking", minute_floor(ts)).unwrap());
        assert!(TaskRepo::exists_at_minute(&conn, "alice", "cooking", minute_floor(ts) + 59).unwrap());
        assert!(!TaskRepo::exists_at_minute(&conn, "alice", "cooking", minute_floor(ts) + 60).unwrap());
        assert!(!TaskRepo::exists_at_minute(&conn, "alice", "travel", ts).unwrap());
        assert!(!TaskRepo::exists_at_minute(&conn, "bob", "cooking", ts).unwrap());
    }

    #[test]
    fn test_cancelled_slot_is_free_again() {
        let conn = DbConnection::connect_in_memory().unwrap();
        let ts = 1_704_103_200;
        let task = TaskRepo::create_scheduled(&conn, Task::new("alice", "cooking", "a", ts, 100), 100).unwrap();
        StageRepo::cancel(&conn, task.id.unwrap(), 150).unwrap();

        assert!(!TaskRepo::exists_at_minute(&conn, "alice", "cooking", ts).unwrap());
        assert!(TaskRepo::taken_minutes(&conn, "alice", "cooking", 0, ts + 60).unwrap().is_empty());
    }

    #[test]
    fn test_list_filters() {
        let conn = DbConnection::connect_in_memory().unwrap();
        let a = TaskRepo::create_scheduled(&conn, Task::new("alice", "cooking", "a", 10, 1), 1).unwrap();
        TaskRepo::create_scheduled(&conn, Task::new("alice", "travel", "b", 20, 1), 1).unwrap();
        StageRepo::acquire_stage(&conn, a.id.unwrap(), Phase::Schedule, 5).unwrap();

        let filter = TaskFilter {
            status: Some(StageStatus::Processing),
            ..Default::default()
        };
        let processing = TaskRepo::list(&conn, &filter).unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].0.title, "a");

        let filter = TaskFilter {
            channel: Some("travel".to_string()),
            ..Default::default()
        };
        assert_eq!(TaskRepo::list(&conn, &filter).unwrap().len(), 1);

        let filter = TaskFilter {
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(TaskRepo::list(&conn, &filter).unwrap().len(), 1);
    }
}
