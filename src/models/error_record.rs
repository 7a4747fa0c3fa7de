use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::Phase;

/// Ordered least to most urgent; claims take the most urgent first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStatus {
    Pending,
    Claimed,
    Processing,
    Resolved,
    Ignored,
    Failed,
}

impl ErrorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorStatus::Pending => "pending",
            ErrorStatus::Claimed => "claimed",
            ErrorStatus::Processing => "processing",
            ErrorStatus::Resolved => "resolved",
            ErrorStatus::Ignored => "ignored",
            ErrorStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ErrorStatus::Pending),
            "claimed" => Some(ErrorStatus::Claimed),
            "processing" => Some(ErrorStatus::Processing),
            "resolved" => Some(ErrorStatus::Resolved),
            "ignored" => Some(ErrorStatus::Ignored),
            "failed" => Some(ErrorStatus::Failed),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ErrorStatus::Pending | ErrorStatus::Claimed | ErrorStatus::Processing
        )
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! text_column {
    ($ty:ty, $what:literal) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                <$ty>::from_str(s)
                    .ok_or_else(|| FromSqlError::Other(format!(concat!("unknown ", $what, ": {}"), s).into()))
            }
        }
    };
}

text_column!(Severity, "severity");
text_column!(ErrorStatus, "error status");

/// A classified failure waiting to be handled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: i64,
    pub error_hash: String,
    pub kind: String,
    pub message: String,
    pub context: Option<String>,
    pub severity: Severity,
    pub status: ErrorStatus,
    pub task_id: Option<i64>,
    pub phase: Option<Phase>,
    pub claimed_by: Option<String>,
    pub claimed_ts: Option<i64>,
    pub retry_count: i64,
    pub resolution: Option<String>,
    pub created_ts: i64,
    pub updated_ts: i64,
}

/// Deduplication key: hex SHA-256 over `kind:message:context`
pub fn error_hash(kind: &str, message: &str, context: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b":");
    hasher.update(message.as_bytes());
    hasher.update(b":");
    hasher.update(context.unwrap_or("").as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
