//! Wall-clock access
//!
//! Everything that compares against "now" (lock ages, tick throttling, due
//! times) reads it through [`Clock`] so tests can pin and advance time.

use std::cell::Cell;

use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone};

pub trait Clock {
    fn now(&self) -> DateTime<Local>;

    /// Current time as a Unix timestamp (UTC seconds), the storage format
    fn now_ts(&self) -> i64 {
        self.now().timestamp()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> DateTime<Local> {
        (**self).now()
    }
}

/// Production clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Manually driven clock for tests and dry runs
#[derive(Debug)]
pub struct FixedClock {
    now: Cell<DateTime<Local>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Local>) -> Self {
        Self { now: Cell::new(now) }
    }

    /// Build from a local wall-clock time such as `2024-01-01T15:00`
    pub fn at(expr: &str) -> anyhow::Result<Self> {
        let naive = NaiveDateTime::parse_from_str(expr, "%Y-%m-%dT%H:%M")?;
        let local = Local
            .from_local_datetime(&naive)
            .earliest()
            .ok_or_else(|| anyhow::anyhow!("Nonexistent local time: {}", expr))?;
        Ok(Self::new(local))
    }

    pub fn set(&self, now: DateTime<Local>) {
        self.now.set(now);
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock_advances() {
        let clock = FixedClock::at("2024-01-01T15:00").unwrap();
        let start = clock.now_ts();
        clock.advance(Duration::minutes(10));
        assert_eq!(clock.now_ts() - start, 600);
    }

    #[test]
    fn test_clock_by_reference() {
        fn read<C: Clock>(c: C) -> i64 {
            c.now_ts()
        }
        let clock = FixedClock::at("2024-03-05T08:30").unwrap();
        assert_eq!(read(&clock), clock.now_ts());
    }
}
