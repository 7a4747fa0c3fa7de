// Duration parsing and formatting for config values and CLI flags

use anyhow::Result;

/// Parse a duration expression and return seconds.
///
/// Accepts unit-suffixed parts in any combination: `30s`, `10m`, `2h`, `1d`,
/// `1h30m`. A bare number is taken as seconds.
pub fn parse_duration(expr: &str) -> Result<i64> {
    let expr = expr.trim();
    if expr.is_empty() {
        anyhow::bail!("Duration cannot be empty");
    }
    if let Ok(secs) = expr.parse::<i64>() {
        if secs <= 0 {
            anyhow::bail!("Duration must be greater than 0");
        }
        return Ok(secs);
    }

    let mut total_secs = 0i64;
    let mut digits = String::new();
    for c in expr.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit_secs = match c {
            'd' => 86400,
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => anyhow::bail!("Invalid duration format: {}", expr),
        };
        let value: i64 = digits
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid duration format: {}", expr))?;
        total_secs += value * unit_secs;
        digits.clear();
    }
    if !digits.is_empty() {
        anyhow::bail!("Invalid duration format: {} (missing unit)", expr);
    }

    if total_secs == 0 {
        anyhow::bail!("Duration must be greater than 0");
    }

    Ok(total_secs)
}

/// Format seconds in the same compact syntax `parse_duration` reads
pub fn format_duration(secs: i64) -> String {
    if secs <= 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    let mut rest = secs;
    for (unit, size) in [("d", 86400), ("h", 3600), ("m", 60), ("s", 1)] {
        if rest >= size {
            out.push_str(&format!("{}{}", rest / size, unit));
            rest %= size;
        }
    }
    out
}
