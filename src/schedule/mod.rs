//! Channel scheduling: when is a channel due next, and which slots are free
//!
//! [`calculator`] holds the pure arithmetic. The helpers here bridge it to the
//! store, translating between local wall-clock times and Unix timestamps.

pub mod calculator;

pub use calculator::*;

use std::collections::BTreeSet;

use anyhow::Result;
use chrono::{DateTime, Duration, Local, NaiveDateTime};
use rusqlite::Connection;

use crate::models::ChannelCadence;
use crate::repo::TaskRepo;
use crate::utils::{local_ts, to_local};

/// Free slots of a channel as local times, skipping minutes already booked
pub fn free_slots(
    conn: &Connection,
    channel: &ChannelCadence,
    now: DateTime<Local>,
    limit: usize,
) -> Result<Vec<NaiveDateTime>> {
    let naive_now = now.naive_local();
    let from = now.timestamp();
    let to = local_ts(&horizon_end(naive_now, 2)).unwrap_or(from) + Duration::minutes(1).num_seconds();
    let taken: BTreeSet<NaiveDateTime> =
        TaskRepo::taken_minutes(conn, &channel.owner, &channel.channel, from, to)?
            .into_iter()
            .filter_map(to_local)
            .map(|dt| minute_of(dt.naive_local()))
            .collect();
    Ok(available_slots(&channel.cadence, naive_now, &taken, limit))
}
