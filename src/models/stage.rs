use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline phase, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Schedule,
    Script,
    Image,
    Video,
    Youtube,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Schedule,
        Phase::Script,
        Phase::Image,
        Phase::Video,
        Phase::Youtube,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Schedule => "schedule",
            Phase::Script => "script",
            Phase::Image => "image",
            Phase::Video => "video",
            Phase::Youtube => "youtube",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "schedule" => Some(Phase::Schedule),
            "script" => Some(Phase::Script),
            "image" => Some(Phase::Image),
            "video" => Some(Phase::Video),
            "youtube" => Some(Phase::Youtube),
            _ => None,
        }
    }

    /// Successor phase, `None` for the terminal phase
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Schedule => Some(Phase::Script),
            Phase::Script => Some(Phase::Image),
            Phase::Image => Some(Phase::Video),
            Phase::Video => Some(Phase::Youtube),
            Phase::Youtube => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for Phase {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Phase {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Phase::from_str(s).ok_or_else(|| FromSqlError::Other(format!("unknown phase: {}", s).into()))
    }
}

/// Status of the single stage record a task carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Waiting,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl StageStatus {
    pub const ALL: [StageStatus; 5] = [
        StageStatus::Waiting,
        StageStatus::Processing,
        StageStatus::Completed,
        StageStatus::Failed,
        StageStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Waiting => "waiting",
            StageStatus::Processing => "processing",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(StageStatus::Waiting),
            "processing" => Some(StageStatus::Processing),
            "completed" => Some(StageStatus::Completed),
            "failed" => Some(StageStatus::Failed),
            "cancelled" => Some(StageStatus::Cancelled),
            _ => None,
        }
    }

    /// Statuses from which an explicit cancel is honored
    pub fn is_cancellable(&self) -> bool {
        matches!(self, StageStatus::Waiting | StageStatus::Processing)
    }

    /// Legal edges of the per-phase state machine.
    ///
    /// `Completed` is only reachable from `Processing`; whether it sticks or is
    /// rewritten to the next phase is decided by [`advance`].
    pub fn can_transition(self, to: StageStatus) -> bool {
        use StageStatus::*;
        matches!(
            (self, to),
            (Waiting, Processing)
                | (Waiting, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Processing, Waiting)
                | (Failed, Waiting)
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for StageStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for StageStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        StageStatus::from_str(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown stage status: {}", s).into()))
    }
}

/// Where a record lands after reaching `status` at `phase`.
///
/// A completed non-terminal phase becomes the next phase, waiting. Completion
/// of the terminal phase and every other status are left as they are.
pub fn advance(phase: Phase, status: StageStatus) -> (Phase, StageStatus) {
    match (status, phase.next()) {
        (StageStatus::Completed, Some(next)) => (next, StageStatus::Waiting),
        _ => (phase, status),
    }
}

/// The one authoritative stage row of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub task_id: i64,
    pub phase: Phase,
    pub status: StageStatus,
    pub error: Option<String>,
    pub retry_count: i64,
    pub created_ts: i64,
    pub started_ts: Option<i64>,
    pub finished_ts: Option<i64>,
    pub modified_ts: i64,
}

impl StageRecord {
    pub fn advanced(&self) -> (Phase, StageStatus) {
        advance(self.phase, self.status)
    }

    /// `completed` stored on a non-terminal phase is never a legal resting state
    pub fn is_defective(&self) -> bool {
        self.status == StageStatus::Completed && !self.phase.is_terminal()
    }

    pub fn is_done(&self) -> bool {
        self.status == StageStatus::Completed && self.phase.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(phase: Phase, status: StageStatus) -> StageRecord {
        StageRecord {
            task_id: 1,
            phase,
            status,
            error: None,
            retry_count: 0,
            created_ts: 0,
            started_ts: None,
            finished_ts: None,
            modified_ts: 0,
        }
    }

    #[test]
    fn test_phase_order() {
        let mut phase = Phase::Schedule;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            seen.push(next);
            phase = next;
        }
        assert_eq!(seen, Phase::ALL.to_vec());
        assert!(Phase::Youtube.is_terminal());
    }

    #[test]
    fn test_phase_conversion() {
        for phase in Phase::ALL {
            assert_eq!(Phase::from_str(phase.as_str()), Some(phase));
        }
        assert_eq!(Phase::from_str("render"), None);
    }

    #[test]
    fn test_script_completed_advances_to_image() {
        let r = record(Phase::Script, StageStatus::Completed);
        assert_eq!(r.advanced(), (Phase::Image, StageStatus::Waiting));
        assert!(r.is_defective());
    }

    #[test]
    fn test_youtube_completed_is_terminal() {
        let r = record(Phase::Youtube, StageStatus::Completed);
        assert_eq!(r.advanced(), (Phase::Youtube, StageStatus::Completed));
        assert!(r.is_done());
        assert!(!r.is_defective());
    }

    #[test]
    fn test_non_completed_statuses_stay() {
        for status in [StageStatus::Waiting, StageStatus::Failed, StageStatus::Cancelled] {
            assert_eq!(advance(Phase::Image, status), (Phase::Image, status));
        }
    }

    #[test]
    fn test_transition_edges() {
        use StageStatus::*;
        assert!(Waiting.can_transition(Processing));
        assert!(Processing.can_transition(Completed));
        assert!(Failed.can_transition(Waiting));
        assert!(!Completed.can_transition(Cancelled));
        assert!(!Failed.can_transition(Cancelled));
        assert!(!Waiting.can_transition(Completed));
        assert!(!Cancelled.can_transition(Waiting));
    }
}
