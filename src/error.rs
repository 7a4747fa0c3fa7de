//! Domain error taxonomy for the stage queue and lock registry
//!
//! Repositories that only do CRUD return `anyhow::Result` like the rest of the
//! crate. The compare-and-swap operations return [`StageError`] so callers can
//! tell contention apart from real failures without string matching.

use thiserror::Error;

use crate::models::{Phase, StageStatus};

/// Errors raised by stage transitions and lock acquisition
#[derive(Debug, Error)]
pub enum StageError {
    /// The lock for a phase kind is held by a live holder
    #[error("{kind} lock is held by task {holder} for {age_secs}s, retry later")]
    RetryLater {
        kind: Phase,
        holder: i64,
        age_secs: i64,
    },

    #[error("task {task_id} cannot move from {phase}/{from} to {to}")]
    IllegalTransition {
        task_id: i64,
        phase: Phase,
        from: StageStatus,
        to: StageStatus,
    },

    #[error("task {0} not found")]
    TaskNotFound(i64),

    #[error("invalid channel configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl StageError {
    /// Contention is expected under load and is never counted as a failure
    pub fn is_contention(&self) -> bool {
        matches!(self, StageError::RetryLater { .. })
    }
}

pub type Result<T, E = StageError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_is_classified() {
        let err = StageError::RetryLater {
            kind: Phase::Image,
            holder: 7,
            age_secs: 12,
        };
        assert!(err.is_contention());
        assert!(err.to_string().contains("image lock is held by task 7"));

        let err = StageError::TaskNotFound(3);
        assert!(!err.is_contention());
    }

    #[test]
    fn test_illegal_transition_message() {
        let err = StageError::IllegalTransition {
            task_id: 4,
            phase: Phase::Video,
            from: StageStatus::Completed,
            to: StageStatus::Cancelled,
        };
        assert_eq!(
            err.to_string(),
            "task 4 cannot move from video/completed to cancelled"
        );
    }
}
