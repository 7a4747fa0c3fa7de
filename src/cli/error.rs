// Error handling utilities for consistent error messages and exit codes

use std::process;

use crate::error::StageError;
use crate::models::{ErrorStatus, Phase, Severity, StageStatus};

/// Exit with a user error (exit code 1)
/// User errors are for invalid input, missing resources, etc.
pub fn user_error(message: &str) -> ! {
    eprintln!("Error: {}", message);
    process::exit(1);
}

/// Whether an error escaping a command is the store's fault rather than the
/// user's. `main` exits 2 for these.
pub fn is_internal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<rusqlite::Error>().is_some()
            || matches!(cause.downcast_ref::<StageError>(), Some(StageError::Storage(_)))
    })
}

/// Validate that a string is not empty
pub fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{} cannot be empty", field_name))
    } else {
        Ok(())
    }
}

/// Owner and channel names: letters, digits, dots, underscores, hyphens
pub fn validate_channel_name(name: &str, field_name: &str) -> Result<(), String> {
    validate_non_empty(name, field_name)?;
    if name.chars().all(|c| c.is_alphanumeric() || c == '.' || c == '_' || c == '-') {
        Ok(())
    } else {
        Err(format!(
            "Invalid {}: '{}'. Only letters, numbers, dots, underscores, and hyphens are allowed.",
            field_name, name
        ))
    }
}

pub fn parse_phase(s: &str) -> Result<Phase, String> {
    Phase::from_str(&s.to_ascii_lowercase()).ok_or_else(|| {
        let names: Vec<&str> = Phase::ALL.iter().map(|p| p.as_str()).collect();
        format!("Invalid phase: '{}'. Expected one of: {}", s, names.join(", "))
    })
}

pub fn parse_stage_status(s: &str) -> Result<StageStatus, String> {
    StageStatus::from_str(&s.to_ascii_lowercase()).ok_or_else(|| {
        let names: Vec<&str> = StageStatus::ALL.iter().map(|st| st.as_str()).collect();
        format!("Invalid status: '{}'. Expected one of: {}", s, names.join(", "))
    })
}

pub fn parse_severity(s: &str) -> Result<Severity, String> {
    Severity::from_str(&s.to_ascii_lowercase())
        .ok_or_else(|| format!("Invalid severity: '{}'. Expected warning, error or critical", s))
}

pub fn parse_error_status(s: &str) -> Result<ErrorStatus, String> {
    ErrorStatus::from_str(&s.to_ascii_lowercase()).ok_or_else(|| {
        format!(
            "Invalid error status: '{}'. Expected pending, claimed, processing, resolved, ignored or failed",
            s
        )
    })
}
