//! Next-slot arithmetic over local wall-clock times
//!
//! Everything here is pure: the same cadence, reference and `now` always give
//! the same answer. Conversion to stored timestamps happens at the caller.

use std::collections::BTreeSet;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::models::{Cadence, IntervalUnit};

/// Minute intervals shorter than this are raised to it
pub const MIN_INTERVAL_MINUTES: u32 = 5;

/// Default number of free slots listed
pub const DEFAULT_SLOT_LIMIT: usize = 10;

/// Days searched ahead in weekday mode, today included
const WEEKDAY_SEARCH_DAYS: i64 = 7;

/// Days of slots offered by [`available_slots`]: today and tomorrow
const SLOT_DAYS: i64 = 2;

fn weekday_key(date: NaiveDate) -> u32 {
    date.weekday().num_days_from_sunday()
}

/// Truncate to the start of the minute
pub fn minute_of(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(t)
}

/// Next due time of `cadence` after `reference`.
///
/// Minute and hour intervals count from `reference`. Day intervals land on the
/// configured time of day, starting from `reference`'s date and stepping by the
/// interval until strictly after `now`. Weekday slots take the earliest slot
/// strictly after `reference` within a week.
pub fn next_due(cadence: &Cadence, reference: NaiveDateTime, now: NaiveDateTime) -> Option<NaiveDateTime> {
    match cadence {
        Cadence::FixedInterval { every, unit, time_of_day } => {
            let every = (*every).max(1);
            match unit {
                IntervalUnit::Minutes => {
                    Some(reference + Duration::minutes(every.max(MIN_INTERVAL_MINUTES) as i64))
                }
                IntervalUnit::Hours => Some(reference + Duration::hours(every as i64)),
                IntervalUnit::Days => Some(next_day_slot(reference.date(), *time_of_day, every, now)),
            }
        }
        Cadence::WeekdayTime { slots } => (0..WEEKDAY_SEARCH_DAYS)
            .map(|offset| reference.date() + Duration::days(offset))
            .flat_map(|date| {
                slots
                    .get(&weekday_key(date))
                    .into_iter()
                    .flatten()
                    .map(move |t| date.and_time(*t))
            })
            .filter(|candidate| *candidate > reference)
            .min(),
    }
}

fn next_day_slot(start: NaiveDate, time_of_day: NaiveTime, every: u32, now: NaiveDateTime) -> NaiveDateTime {
    let step = every as i64;
    let mut candidate = start.and_time(time_of_day);
    if candidate <= now {
        // Jump close to `now` first so an old reference does not loop per interval
        let behind = (now.date() - candidate.date()).num_days();
        let skip = behind / step;
        candidate = (candidate.date() + Duration::days(skip * step)).and_time(time_of_day);
    }
    while candidate <= now {
        candidate = (candidate.date() + Duration::days(step)).and_time(time_of_day);
    }
    candidate
}

/// Last instant a candidate may fall on: 23:59:59 of `now + horizon_days`
pub fn horizon_end(now: NaiveDateTime, horizon_days: i64) -> NaiveDateTime {
    let day = now.date() + Duration::days(horizon_days);
    day.and_hms_opt(23, 59, 59).unwrap_or_else(|| day.and_time(NaiveTime::MIN))
}

/// A candidate is usable only if it is in the future and not past the horizon
pub fn within_horizon(candidate: NaiveDateTime, now: NaiveDateTime, horizon_days: i64) -> bool {
    candidate > now && candidate <= horizon_end(now, horizon_days)
}

/// Free weekday slots of today and tomorrow, in order.
///
/// Slots not after `now` and slots whose minute is in `taken` are skipped.
/// Fixed-interval cadences have no slots.
pub fn available_slots(
    cadence: &Cadence,
    now: NaiveDateTime,
    taken: &BTreeSet<NaiveDateTime>,
    limit: usize,
) -> Vec<NaiveDateTime> {
    let Cadence::WeekdayTime { slots } = cadence else {
        return Vec::new();
    };

    let mut free: Vec<NaiveDateTime> = (0..SLOT_DAYS)
        .map(|offset| now.date() + Duration::days(offset))
        .flat_map(|date| {
            slots
                .get(&weekday_key(date))
                .into_iter()
                .flatten()
                .map(move |t| date.and_time(*t))
        })
        .filter(|slot| *slot > now && !taken.contains(&minute_of(*slot)))
        .collect();
    free.sort();
    free.dedup();
    free.truncate(limit);
    free
}
