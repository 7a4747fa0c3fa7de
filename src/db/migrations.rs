use rusqlite::{Connection, Result};
use std::collections::HashMap;

use crate::models::Phase;

/// Current database schema version
const CURRENT_VERSION: u32 = 3;

type Migration = fn(&rusqlite::Transaction) -> Result<(), rusqlite::Error>;

/// Migration system for managing database schema versions
pub struct MigrationManager;

impl MigrationManager {
    /// Initialize the database with the current schema
    /// This creates the schema_version table and applies all migrations
    pub fn initialize(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )?;

        let current_version = Self::get_version(conn)?;

        for version in (current_version + 1)..=CURRENT_VERSION {
            Self::apply_migration(conn, version)?;
        }

        Ok(())
    }

    /// Apply a specific migration by version number
    fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
        let migrations = get_migrations();
        if let Some(migration) = migrations.get(&version) {
            let tx = conn.unchecked_transaction()?;
            migration(&tx)?;
            tx.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [version],
            )?;
            tx.commit()?;
            Ok(())
        } else {
            Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_MISUSE),
                Some(format!("No migration found for version {}", version)),
            ))
        }
    }

    /// Get the current schema version
    pub fn get_version(conn: &Connection) -> Result<u32> {
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
    }

    pub fn current_version() -> u32 {
        CURRENT_VERSION
    }
}

/// Get all migrations indexed by version
fn get_migrations() -> HashMap<u32, Migration> {
    let mut migrations: HashMap<u32, Migration> = HashMap::new();
    migrations.insert(1, migration_v1);
    migrations.insert(2, migration_v2);
    migrations.insert(3, migration_v3);
    migrations
}

/// Migration v1: tasks, the stage queue, phase locks and the two append-only streams
fn migration_v1(tx: &rusqlite::Transaction) -> Result<(), rusqlite::Error> {
    tx.execute(
        "CREATE TABLE tasks (
            id INTEGER PRIMARY KEY,
            uuid TEXT NOT NULL UNIQUE,
            owner TEXT NOT NULL,
            channel TEXT NOT NULL,
            category TEXT NULL,
            title TEXT NOT NULL,
            content_id TEXT NULL,
            scheduled_ts INTEGER NOT NULL,
            expected_total INTEGER NULL,
            done INTEGER NOT NULL DEFAULT 0,
            done_ts INTEGER NULL,
            created_ts INTEGER NOT NULL,
            modified_ts INTEGER NOT NULL
        )",
        [],
    )?;
    tx.execute(
        "CREATE INDEX idx_tasks_channel_slot ON tasks(owner, channel, scheduled_ts)",
        [],
    )?;

    // One row per task, rewritten in place as the task moves through phases
    tx.execute(
        "CREATE TABLE stage_records (
            task_id INTEGER PRIMARY KEY REFERENCES tasks(id) ON DELETE CASCADE,
            phase TEXT NOT NULL CHECK(phase IN ('schedule','script','image','video','youtube')),
            status TEXT NOT NULL CHECK(status IN ('waiting','processing','completed','failed','cancelled')),
            error TEXT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_ts INTEGER NOT NULL,
            started_ts INTEGER NULL,
            finished_ts INTEGER NULL,
            modified_ts INTEGER NOT NULL
        )",
        [],
    )?;
    tx.execute(
        "CREATE INDEX idx_stage_records_phase_status ON stage_records(phase, status, created_ts)",
        [],
    )?;

    tx.execute(
        "CREATE TABLE stage_locks (
            kind TEXT PRIMARY KEY CHECK(kind IN ('schedule','script','image','video','youtube')),
            holder_task_id INTEGER NULL,
            acquired_ts INTEGER NULL,
            owner_pid INTEGER NULL
        )",
        [],
    )?;
    for phase in Phase::ALL {
        tx.execute(
            "INSERT INTO stage_locks (kind) VALUES (?1)",
            [phase.as_str()],
        )?;
    }

    tx.execute(
        "CREATE TABLE stage_events (
            id INTEGER PRIMARY KEY,
            task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            phase TEXT NOT NULL,
            from_status TEXT NULL,
            to_status TEXT NOT NULL,
            detail TEXT NULL,
            created_ts INTEGER NOT NULL
        )",
        [],
    )?;
    tx.execute("CREATE INDEX idx_stage_events_task ON stage_events(task_id)", [])?;

    tx.execute(
        "CREATE TABLE stage_logs (
            id INTEGER PRIMARY KEY,
            task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            phase TEXT NOT NULL,
            line TEXT NOT NULL,
            created_ts INTEGER NOT NULL
        )",
        [],
    )?;
    tx.execute(
        "CREATE INDEX idx_stage_logs_task_phase ON stage_logs(task_id, phase, id)",
        [],
    )?;

    Ok(())
}

/// Migration v2: channel cadences and the title inventory
fn migration_v2(tx: &rusqlite::Transaction) -> Result<(), rusqlite::Error> {
    tx.execute(
        "CREATE TABLE channel_cadences (
            id INTEGER PRIMARY KEY,
            owner TEXT NOT NULL,
            channel TEXT NOT NULL,
            name TEXT NULL,
            mode TEXT NOT NULL,
            interval_value INTEGER NULL,
            interval_unit TEXT NULL,
            default_time TEXT NULL,
            weekday_times TEXT NULL,
            categories TEXT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_ts INTEGER NOT NULL,
            modified_ts INTEGER NOT NULL,
            UNIQUE(owner, channel)
        )",
        [],
    )?;

    tx.execute(
        "CREATE TABLE title_pool (
            id INTEGER PRIMARY KEY,
            category TEXT NOT NULL,
            title TEXT NOT NULL,
            used INTEGER NOT NULL DEFAULT 0,
            created_ts INTEGER NOT NULL,
            UNIQUE(category, title)
        )",
        [],
    )?;
    tx.execute(
        "CREATE INDEX idx_title_pool_category ON title_pool(category, used, id)",
        [],
    )?;

    Ok(())
}

/// Migration v3: error ledger
fn migration_v3(tx: &rusqlite::Transaction) -> Result<(), rusqlite::Error> {
    tx.execute(
        "CREATE TABLE error_records (
            id INTEGER PRIMARY KEY,
            error_hash TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            message TEXT NOT NULL,
            context TEXT NULL,
            severity TEXT NOT NULL CHECK(severity IN ('warning','error','critical')),
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK(status IN ('pending','claimed','processing','resolved','ignored','failed')),
            task_id INTEGER NULL,
            phase TEXT NULL,
            claimed_by TEXT NULL,
            claimed_ts INTEGER NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            resolution TEXT NULL,
            created_ts INTEGER NOT NULL,
            updated_ts INTEGER NOT NULL
        )",
        [],
    )?;
    tx.execute(
        "CREATE INDEX idx_error_records_status ON error_records(status, severity, created_ts)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    #[test]
    fn test_migration_applies_cleanly() {
        let conn = fresh();
        MigrationManager::initialize(&conn).unwrap();
        assert_eq!(MigrationManager::get_version(&conn).unwrap(), CURRENT_VERSION);

        let locks: i64 = conn
            .query_row("SELECT COUNT(*) FROM stage_locks WHERE holder_task_id IS NULL", [], |r| r.get(0))
            .unwrap();
        assert_eq!(locks, 5);
    }

    #[test]
    fn test_migration_is_idempotent() {
        let conn = fresh();
        MigrationManager::initialize(&conn).unwrap();
        MigrationManager::initialize(&conn).unwrap();
        assert_eq!(MigrationManager::get_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_one_stage_record_per_task() {
        let conn = fresh();
        MigrationManager::initialize(&conn).unwrap();
        conn.execute(
            "INSERT INTO tasks (uuid, owner, channel, title, scheduled_ts, created_ts, modified_ts)
             VALUES ('u1', 'o', 'c', 't', 0, 0, 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO stage_records (task_id, phase, status, created_ts, modified_ts)
             VALUES (1, 'schedule', 'waiting', 0, 0)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO stage_records (task_id, phase, status, created_ts, modified_ts)
             VALUES (1, 'script', 'waiting', 0, 0)",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_foreign_key_constraints() {
        let conn = fresh();
        MigrationManager::initialize(&conn).unwrap();
        let result = conn.execute(
            "INSERT INTO stage_records (task_id, phase, status, created_ts, modified_ts)
             VALUES (999, 'schedule', 'waiting', 0, 0)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_status_check_constraint() {
        let conn = fresh();
        MigrationManager::initialize(&conn).unwrap();
        conn.execute(
            "INSERT INTO tasks (uuid, owner, channel, title, scheduled_ts, created_ts, modified_ts)
             VALUES ('u1', 'o', 'c', 't', 0, 0, 0)",
            [],
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO stage_records (task_id, phase, status, created_ts, modified_ts)
             VALUES (1, 'schedule', 'paused', 0, 0)",
            [],
        );
        assert!(result.is_err());
    }
}
