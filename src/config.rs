//! `~/.stagehand/rc` configuration
//!
//! The rc file holds `key=value` lines with `#` comments. Every key is
//! optional; missing keys fall back to [`Config::default`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;

use crate::models::Phase;
use crate::utils::parse_duration;

/// Seconds after which a lock holder counts as a zombie
#[derive(Debug, Clone, PartialEq)]
pub struct LockTimeouts {
    pub default_secs: i64,
    pub per_phase: HashMap<Phase, i64>,
}

impl LockTimeouts {
    pub fn for_phase(&self, phase: Phase) -> i64 {
        self.per_phase.get(&phase).copied().unwrap_or(self.default_secs)
    }
}

impl Default for LockTimeouts {
    fn default() -> Self {
        let mut per_phase = HashMap::new();
        per_phase.insert(Phase::Script, 10 * 60);
        per_phase.insert(Phase::Image, 30 * 60);
        Self {
            default_secs: 30 * 60,
            per_phase,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutomationConfig {
    pub enabled: bool,
    /// Minimum time between two real ticks; earlier calls get the cached summary
    pub min_interval_secs: i64,
    /// Sleep between ticks in `stagehand run`
    pub poll_secs: i64,
    /// Candidates later than the end of day `today + horizon_days` are skipped
    pub horizon_days: i64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_secs: 10 * 60,
            poll_secs: 60,
            horizon_days: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorLedgerConfig {
    pub max_retries: i64,
    pub stuck_timeout_secs: i64,
}

impl Default for ErrorLedgerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            stuck_timeout_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_location: Option<PathBuf>,
    pub lock_timeouts: LockTimeouts,
    pub automation: AutomationConfig,
    pub errors: ErrorLedgerConfig,
    /// Processing records older than this are reported by the health check
    pub stage_stuck_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_location: None,
            lock_timeouts: LockTimeouts::default(),
            automation: AutomationConfig::default(),
            errors: ErrorLedgerConfig::default(),
            stage_stuck_secs: 10 * 60,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => anyhow::bail!("{}: expected a boolean, got '{}'", key, value),
    }
}

fn parse_secs(key: &str, value: &str) -> Result<i64> {
    parse_duration(value).with_context(|| format!("{}: invalid duration '{}'", key, value))
}

fn parse_count(key: &str, value: &str) -> Result<i64> {
    value
        .parse::<i64>()
        .ok()
        .filter(|n| *n >= 0)
        .ok_or_else(|| anyhow::anyhow!("{}: expected a non-negative number, got '{}'", key, value))
}

impl Config {
    /// Directory holding the rc file and, by default, the database
    pub fn dir() -> Result<PathBuf> {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .ok_or_else(|| anyhow::anyhow!("Cannot determine home directory (HOME not set)"))?;
        Ok(home.join(".stagehand"))
    }

    pub fn path() -> Result<PathBuf> {
        Ok(Self::dir()?.join("rc"))
    }

    /// Load the rc file if present, otherwise defaults
    pub fn load() -> Result<Config> {
        let path = Self::path()?;
        if !path.exists() {
            return Ok(Config::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse rc text. Relative `data.location` paths resolve against `base`.
    pub fn parse(text: &str, base: &Path) -> Result<Config> {
        let mut config = Config::default();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("line {}: expected key=value", lineno + 1))?;
            let (key, value) = (key.trim(), value.trim());

            match key {
                "data.location" => {
                    let path = PathBuf::from(value);
                    config.data_location = Some(if path.is_relative() {
                        base.join(path)
                    } else {
                        path
                    });
                }
                "lock.timeout.default" => {
                    config.lock_timeouts.default_secs = parse_secs(key, value)?;
                }
                "automation.enabled" => config.automation.enabled = parse_bool(key, value)?,
                "automation.interval" => {
                    config.automation.min_interval_secs = parse_secs(key, value)?
                }
                "automation.poll" => config.automation.poll_secs = parse_secs(key, value)?,
                "automation.horizon_days" => {
                    config.automation.horizon_days = parse_count(key, value)?
                }
                "errors.max_retries" => config.errors.max_retries = parse_count(key, value)?,
                "errors.stuck_timeout" => {
                    config.errors.stuck_timeout_secs = parse_secs(key, value)?
                }
                "stage.stuck_timeout" => config.stage_stuck_secs = parse_secs(key, value)?,
                _ => {
                    if let Some(phase) = key.strip_prefix("lock.timeout.") {
                        let phase = Phase::from_str(phase)
                            .ok_or_else(|| anyhow::anyhow!("{}: unknown phase '{}'", key, phase))?;
                        config
                            .lock_timeouts
                            .per_phase
                            .insert(phase, parse_secs(key, value)?);
                    } else {
                        debug!(key = key; "ignoring unknown config key");
                    }
                }
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.lock_timeouts.for_phase(Phase::Script), 600);
        assert_eq!(config.lock_timeouts.for_phase(Phase::Image), 1800);
        assert_eq!(config.lock_timeouts.for_phase(Phase::Video), 1800);
        assert_eq!(config.errors.max_retries, 3);
        assert!(config.automation.enabled);
        assert_eq!(config.automation.min_interval_secs, 600);
    }

    #[test]
    fn test_parse_overrides() {
        let text = "\
# pipeline settings
data.location=./pipeline.db
lock.timeout.default=20m
lock.timeout.video=1h
automation.enabled=false
automation.interval=5m
errors.max_retries=5
some.future.key=1
";
        let config = Config::parse(text, Path::new("/tmp/home/.stagehand")).unwrap();
        assert_eq!(
            config.data_location,
            Some(PathBuf::from("/tmp/home/.stagehand/pipeline.db"))
        );
        assert_eq!(config.lock_timeouts.for_phase(Phase::Video), 3600);
        assert_eq!(config.lock_timeouts.for_phase(Phase::Youtube), 1200);
        assert_eq!(config.lock_timeouts.for_phase(Phase::Script), 600);
        assert!(!config.automation.enabled);
        assert_eq!(config.automation.min_interval_secs, 300);
        assert_eq!(config.errors.max_retries, 5);
    }

    #[test]
    fn test_malformed_values_are_errors() {
        let base = Path::new("/tmp");
        assert!(Config::parse("automation.enabled=maybe", base).is_err());
        assert!(Config::parse("lock.timeout.render=10m", base).is_err());
        assert!(Config::parse("lock.timeout.default=soon", base).is_err());
        assert!(Config::parse("no equals sign", base).is_err());
    }
}
