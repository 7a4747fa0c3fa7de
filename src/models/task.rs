use serde::{Deserialize, Serialize};

/// One content unit, driven through every phase under a single identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Option<i64>,
    pub uuid: String,
    pub owner: String,
    pub channel: String,
    pub category: Option<String>,
    pub title: String,
    pub content_id: Option<String>,
    pub scheduled_ts: i64,
    /// Expected milestone total (e.g. scene count) used by progress estimation
    pub expected_total: Option<i64>,
    pub done: bool,
    pub done_ts: Option<i64>,
    pub created_ts: i64,
    pub modified_ts: i64,
}

impl Task {
    pub fn new(owner: &str, channel: &str, title: &str, scheduled_ts: i64, now: i64) -> Self {
        Self {
            id: None,
            uuid: uuid::Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            channel: channel.to_string(),
            category: None,
            title: title.to_string(),
            content_id: None,
            scheduled_ts,
            expected_total: None,
            done: false,
            done_ts: None,
            created_ts: now,
            modified_ts: now,
        }
    }
}
