// Date expression parsing and timestamp formatting

use anyhow::Result;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone};

/// Resolve a local wall-clock time to a Unix timestamp (UTC).
///
/// Times falling into a DST gap resolve to `None`; ambiguous times take the
/// earlier instant.
pub fn local_ts(naive: &NaiveDateTime) -> Option<i64> {
    Local.from_local_datetime(naive).earliest().map(|dt| dt.timestamp())
}

pub fn to_local(ts: i64) -> Option<DateTime<Local>> {
    Local.timestamp_opt(ts, 0).single()
}

/// Parse a date expression and return Unix timestamp (UTC)
///
/// Supported: `2026-01-10`, `2026-01-10T14:30`, `2026-01-10 14:30`, `now`,
/// `today`, `tomorrow`, and `+<duration>` relative to `now`.
pub fn parse_date_expr(expr: &str, now: DateTime<Local>) -> Result<i64> {
    let expr = expr.trim();

    if let Ok(date) = NaiveDate::parse_from_str(expr, "%Y-%m-%d") {
        let datetime = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow::anyhow!("Invalid date"))?;
        return local_ts(&datetime).ok_or_else(|| anyhow::anyhow!("Nonexistent local date: {}", expr));
    }

    for format in ["%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(expr, format) {
            return local_ts(&datetime)
                .ok_or_else(|| anyhow::anyhow!("Nonexistent local datetime: {}", expr));
        }
    }

    if let Some(rel) = expr.strip_prefix('+') {
        let secs = super::duration::parse_duration(rel)?;
        return Ok(now.timestamp() + secs);
    }

    let midnight = |days: i64| -> Result<i64> {
        let day = (now.date_naive() + chrono::Duration::days(days))
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow::anyhow!("Invalid date"))?;
        local_ts(&day).ok_or_else(|| anyhow::anyhow!("Nonexistent local date"))
    };

    match expr {
        "now" => Ok(now.timestamp()),
        "today" => midnight(0),
        "tomorrow" => midnight(1),
        _ => anyhow::bail!(
            "Unsupported date expression: {}. Use YYYY-MM-DD, YYYY-MM-DDTHH:MM, now, today, tomorrow or +<duration>.",
            expr
        ),
    }
}

/// Timestamp as local `YYYY-MM-DD HH:MM`
pub fn format_ts(ts: i64) -> String {
    match to_local(ts) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
        None => ts.to_string(),
    }
}

pub fn format_opt_ts(ts: Option<i64>) -> String {
    ts.map(format_ts).unwrap_or_else(|| "-".to_string())
}
