use serde::{Deserialize, Serialize};

use super::Phase;

/// Global mutual-exclusion slot for one phase kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageLock {
    pub kind: Phase,
    pub holder_task_id: Option<i64>,
    pub acquired_ts: Option<i64>,
    pub owner_pid: Option<i64>,
}

impl StageLock {
    pub fn is_free(&self) -> bool {
        self.holder_task_id.is_none()
    }

    pub fn age_secs(&self, now: i64) -> Option<i64> {
        self.acquired_ts.map(|ts| (now - ts).max(0))
    }
}

/// Result of a successful acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    Fresh,
    /// Taken over from a holder whose lock outlived its timeout
    Reclaimed { previous: i64 },
}
