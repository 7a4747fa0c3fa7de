use serde::{Deserialize, Serialize};

use super::{Phase, StageStatus};

/// One line of phase output, the raw material for progress estimation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageLogLine {
    pub id: i64,
    pub task_id: i64,
    pub phase: Phase,
    pub line: String,
    pub created_ts: i64,
}

/// Audit row written for every stage transition. Never read to decide state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub id: i64,
    pub task_id: i64,
    pub phase: Phase,
    pub from_status: Option<StageStatus>,
    pub to_status: StageStatus,
    pub detail: Option<String>,
    pub created_ts: i64,
}

/// Pre-generated title waiting to be used by the content generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleCandidate {
    pub id: i64,
    pub category: String,
    pub title: String,
    pub used: bool,
    pub created_ts: i64,
}
