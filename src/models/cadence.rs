use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::error::StageError;

/// Time-of-day used for day intervals when none is configured
pub const DEFAULT_TIME_OF_DAY: &str = "11:00";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

impl IntervalUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Minutes => "minutes",
            IntervalUnit::Hours => "hours",
            IntervalUnit::Days => "days",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "minutes" | "minute" | "m" => Some(IntervalUnit::Minutes),
            "hours" | "hour" | "h" => Some(IntervalUnit::Hours),
            "days" | "day" | "d" => Some(IntervalUnit::Days),
            _ => None,
        }
    }
}

/// Validated scheduling rule of a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Cadence {
    FixedInterval {
        every: u32,
        unit: IntervalUnit,
        time_of_day: NaiveTime,
    },
    /// Slots keyed by weekday, 0 = Sunday through 6 = Saturday
    WeekdayTime { slots: BTreeMap<u32, Vec<NaiveTime>> },
}

impl Cadence {
    pub fn mode(&self) -> &'static str {
        match self {
            Cadence::FixedInterval { .. } => "fixed_interval",
            Cadence::WeekdayTime { .. } => "weekday_time",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::FixedInterval { every, unit: IntervalUnit::Days, time_of_day } => {
                write!(f, "every {} days at {}", every, time_of_day.format("%H:%M"))
            }
            Cadence::FixedInterval { every, unit, .. } => {
                write!(f, "every {} {}", every, unit.as_str())
            }
            Cadence::WeekdayTime { slots } => {
                const NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
                let parts: Vec<String> = slots
                    .iter()
                    .filter(|(_, times)| !times.is_empty())
                    .map(|(day, times)| {
                        let times: Vec<String> =
                            times.iter().map(|t| t.format("%H:%M").to_string()).collect();
                        format!("{} {}", NAMES[*day as usize % 7], times.join(","))
                    })
                    .collect();
                write!(f, "{}", parts.join("; "))
            }
        }
    }
}

/// A channel's cadence, validated
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelCadence {
    pub id: i64,
    pub owner: String,
    pub channel: String,
    pub name: Option<String>,
    pub cadence: Cadence,
    pub categories: Vec<String>,
    pub active: bool,
}

/// A `channel_cadences` row as stored: loose columns plus JSON text
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CadenceRow {
    pub id: i64,
    pub owner: String,
    pub channel: String,
    pub name: Option<String>,
    pub mode: String,
    pub interval_value: Option<i64>,
    pub interval_unit: Option<String>,
    pub default_time: Option<String>,
    pub weekday_times: Option<String>,
    pub categories: Option<String>,
    pub active: bool,
}

pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

fn invalid(row: &CadenceRow, what: impl fmt::Display) -> StageError {
    StageError::ConfigurationInvalid(format!("{}/{}: {}", row.owner, row.channel, what))
}

impl CadenceRow {
    /// Storage row for a validated cadence
    pub fn from_cadence(owner: &str, channel: &str, cadence: &Cadence, categories: &[String]) -> Self {
        let (interval_value, interval_unit, default_time, weekday_times) = cadence_columns(cadence);
        Self {
            id: 0,
            owner: owner.to_string(),
            channel: channel.to_string(),
            name: None,
            mode: cadence.mode().to_string(),
            interval_value,
            interval_unit,
            default_time,
            weekday_times,
            categories: serde_json::to_string(categories).ok(),
            active: true,
        }
    }

    /// Parse the weekday JSON map, e.g. `{"1": ["09:00", "18:00"]}`
    fn parse_weekday_times(&self) -> Result<BTreeMap<u32, Vec<NaiveTime>>, StageError> {
        let raw = self
            .weekday_times
            .as_deref()
            .ok_or_else(|| invalid(self, "weekday_time mode without weekday times"))?;
        let parsed: BTreeMap<String, Vec<String>> =
            serde_json::from_str(raw).map_err(|e| invalid(self, format!("weekday times: {}", e)))?;

        let mut slots = BTreeMap::new();
        for (key, times) in parsed {
            let day: u32 = key
                .trim()
                .parse()
                .ok()
                .filter(|d| *d < 7)
                .ok_or_else(|| invalid(self, format!("weekday key '{}' is not 0-6", key)))?;
            let mut parsed_times = Vec::with_capacity(times.len());
            for t in &times {
                let time = parse_time_of_day(t)
                    .ok_or_else(|| invalid(self, format!("time slot '{}' is not HH:MM", t)))?;
                parsed_times.push(time);
            }
            parsed_times.sort();
            parsed_times.dedup();
            slots.insert(day, parsed_times);
        }
        if slots.values().all(|times| times.is_empty()) {
            return Err(invalid(self, "weekday_time mode without any slot"));
        }
        Ok(slots)
    }

    fn parse_categories(&self) -> Result<Vec<String>, StageError> {
        let raw = self
            .categories
            .as_deref()
            .ok_or_else(|| invalid(self, "no categories"))?;
        let categories: Vec<String> =
            serde_json::from_str(raw).map_err(|e| invalid(self, format!("categories: {}", e)))?;
        let categories: Vec<String> = categories
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if categories.is_empty() {
            return Err(invalid(self, "category list is empty"));
        }
        Ok(categories)
    }

    fn parse_cadence(&self) -> Result<Cadence, StageError> {
        match self.mode.as_str() {
            "fixed_interval" => {
                let every = self
                    .interval_value
                    .filter(|v| *v >= 1 && *v <= u32::MAX as i64)
                    .ok_or_else(|| invalid(self, "interval value must be at least 1"))?
                    as u32;
                let unit = self
                    .interval_unit
                    .as_deref()
                    .and_then(IntervalUnit::from_str)
                    .ok_or_else(|| invalid(self, "interval unit must be minutes, hours or days"))?;
                let time_text = self.default_time.as_deref().unwrap_or(DEFAULT_TIME_OF_DAY);
                let time_of_day = parse_time_of_day(time_text)
                    .ok_or_else(|| invalid(self, format!("time of day '{}' is not HH:MM", time_text)))?;
                Ok(Cadence::FixedInterval { every, unit, time_of_day })
            }
            "weekday_time" => Ok(Cadence::WeekdayTime {
                slots: self.parse_weekday_times()?,
            }),
            other => Err(invalid(self, format!("unknown mode '{}'", other))),
        }
    }
}

impl TryFrom<CadenceRow> for ChannelCadence {
    type Error = StageError;

    fn try_from(row: CadenceRow) -> Result<Self, Self::Error> {
        let cadence = row.parse_cadence()?;
        let categories = row.parse_categories()?;
        Ok(ChannelCadence {
            id: row.id,
            owner: row.owner,
            channel: row.channel,
            name: row.name,
            cadence,
            categories,
            active: row.active,
        })
    }
}

/// Flatten a cadence back into storage columns
pub fn cadence_columns(cadence: &Cadence) -> (Option<i64>, Option<String>, Option<String>, Option<String>) {
    match cadence {
        Cadence::FixedInterval { every, unit, time_of_day } => (
            Some(*every as i64),
            Some(unit.as_str().to_string()),
            Some(time_of_day.format("%H:%M").to_string()),
            None,
        ),
        Cadence::WeekdayTime { slots } => {
            let map: BTreeMap<String, Vec<String>> = slots
                .iter()
                .map(|(day, times)| {
                    (
                        day.to_string(),
                        times.iter().map(|t| t.format("%H:%M").to_string()).collect(),
                    )
                })
                .collect();
            // A map of strings always serializes
            let json = serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string());
            (None, None, None, Some(json))
        }
    }
}
