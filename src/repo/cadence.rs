use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::models::CadenceRow;

const SELECT_CADENCE: &str = "SELECT id, owner, channel, name, mode, interval_value, interval_unit,
        default_time, weekday_times, categories, active
     FROM channel_cadences";

fn map_row(row: &Row) -> rusqlite::Result<CadenceRow> {
    Ok(CadenceRow {
        id: row.get(0)?,
        owner: row.get(1)?,
        channel: row.get(2)?,
        name: row.get(3)?,
        mode: row.get(4)?,
        interval_value: row.get(5)?,
        interval_unit: row.get(6)?,
        default_time: row.get(7)?,
        weekday_times: row.get(8)?,
        categories: row.get(9)?,
        active: row.get(10)?,
    })
}

/// Channel cadence repository. Rows are returned raw; validation into
/// `ChannelCadence` happens at the caller.
pub struct CadenceRepo;

impl CadenceRepo {
    /// Insert or replace the cadence of `(owner, channel)`
    pub fn save(conn: &Connection, row: &CadenceRow, now: i64) -> Result<i64> {
        conn.execute(
            "INSERT INTO channel_cadences (owner, channel, name, mode, interval_value, interval_unit,
                    default_time, weekday_times, categories, active, created_ts, modified_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT(owner, channel) DO UPDATE SET
                name = excluded.name,
                mode = excluded.mode,
                interval_value = excluded.interval_value,
                interval_unit = excluded.interval_unit,
                default_time = excluded.default_time,
                weekday_times = excluded.weekday_times,
                categories = excluded.categories,
                active = excluded.active,
                modified_ts = excluded.modified_ts",
            rusqlite::params![
                row.owner,
                row.channel,
                row.name,
                row.mode,
                row.interval_value,
                row.interval_unit,
                row.default_time,
                row.weekday_times,
                row.categories,
                row.active,
                now
            ],
        )
        .with_context(|| format!("Failed to save cadence for {}/{}", row.owner, row.channel))?;

        let id = conn.query_row(
            "SELECT id FROM channel_cadences WHERE owner = ?1 AND channel = ?2",
            rusqlite::params![row.owner, row.channel],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn get(conn: &Connection, owner: &str, channel: &str) -> Result<Option<CadenceRow>> {
        let sql = format!("{} WHERE owner = ?1 AND channel = ?2", SELECT_CADENCE);
        Ok(conn
            .query_row(&sql, rusqlite::params![owner, channel], map_row)
            .optional()?)
    }

    pub fn list(conn: &Connection, active_only: bool) -> Result<Vec<CadenceRow>> {
        let sql = format!(
            "{} WHERE (?1 = 0 OR active = 1) ORDER BY owner, channel",
            SELECT_CADENCE
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([active_only], map_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_active(conn: &Connection, owner: &str, channel: &str, active: bool, now: i64) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE channel_cadences SET active = ?3, modified_ts = ?4 WHERE owner = ?1 AND channel = ?2",
            rusqlite::params![owner, channel, active, now],
        )?;
        Ok(changed == 1)
    }
}
