use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::models::TitleCandidate;

/// Remaining and used title counts of one category
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TitleStats {
    pub category: String,
    pub available: i64,
    pub used: i64,
}

/// Inventory of pre-generated titles
pub struct TitleRepo;

impl TitleRepo {
    /// Add a title; duplicates within a category are ignored. Returns whether it was new.
    pub fn add(conn: &Connection, category: &str, title: &str, now: i64) -> Result<bool> {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO title_pool (category, title, used, created_ts) VALUES (?1, ?2, 0, ?3)",
            rusqlite::params![category, title, now],
        )?;
        Ok(inserted == 1)
    }

    /// Take the oldest unused title of a category, marking it used
    pub fn take(conn: &Connection, category: &str) -> Result<Option<TitleCandidate>> {
        // Retry if a concurrent taker wins the CAS on the same row
        for _ in 0..3 {
            let candidate = conn
                .query_row(
                    "SELECT id, category, title, used, created_ts FROM title_pool
                     WHERE category = ?1 AND used = 0 ORDER BY id LIMIT 1",
                    [category],
                    |row| {
                        Ok(TitleCandidate {
                            id: row.get(0)?,
                            category: row.get(1)?,
                            title: row.get(2)?,
                            used: row.get(3)?,
                            created_ts: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            let Some(candidate) = candidate else {
                return Ok(None);
            };
            let claimed = conn.execute(
                "UPDATE title_pool SET used = 1 WHERE id = ?1 AND used = 0",
                [candidate.id],
            )?;
            if claimed == 1 {
                return Ok(Some(TitleCandidate { used: true, ..candidate }));
            }
        }
        Ok(None)
    }

    pub fn stats(conn: &Connection) -> Result<Vec<TitleStats>> {
        let mut stmt = conn.prepare(
            "SELECT category, SUM(used = 0), SUM(used = 1) FROM title_pool
             GROUP BY category ORDER BY category",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TitleStats {
                category: row.get(0)?,
                available: row.get(1)?,
                used: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
