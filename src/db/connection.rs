use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::config::Config;
use crate::db::migrations::MigrationManager;

/// Waiting writer gives up after this long and surfaces SQLITE_BUSY
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection manager
pub struct DbConnection;

impl DbConnection {
    /// Get the default database path
    pub fn default_path() -> Result<PathBuf> {
        Ok(Config::dir()?.join("pipeline.db"))
    }

    /// Get database path from configuration or default
    pub fn resolve_path(config: &Config) -> Result<PathBuf> {
        match &config.data_location {
            Some(path) => Ok(path.clone()),
            None => Self::default_path(),
        }
    }

    /// Connect to the configured database, creating it and parent directories if needed
    pub fn connect(config: &Config) -> Result<Connection> {
        let db_path = Self::resolve_path(config)?;

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // Several workers and the control loop share one file
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set database busy timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("Failed to enable WAL journal")?;

        Self::prepare(&conn)?;
        Ok(conn)
    }

    /// Connect to an in-memory database (for testing)
    pub fn connect_in_memory() -> Result<Connection> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::prepare(&conn)?;
        Ok(conn)
    }

    fn prepare(conn: &Connection) -> Result<()> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        MigrationManager::initialize(conn).context("Failed to initialize database schema")?;
        Ok(())
    }
}
