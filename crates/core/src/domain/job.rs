use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::file::FileId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Analysis,
    Transformation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Accepts the wire spellings used by the analysis and transformation services.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" => Some(Self::Pending),
            "running" | "in_progress" => Some(Self::Running),
            "completed" | "complete" | "success" | "done" => Some(Self::Completed),
            "failed" | "error" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRef {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result_file_id: Option<FileId>,
    pub last_error: Option<String>,
}

impl JobRef {
    pub fn new(id: JobId, kind: JobKind, status: JobStatus) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            status,
            created_at: now,
            updated_at: now,
            result_file_id: None,
            last_error: None,
        }
    }

    /// Records a polled status. Returns true when the status actually changed.
    pub fn refresh(&mut self, status: JobStatus, error: Option<String>) -> bool {
        let changed = self.status != status;
        self.status = status;
        if error.is_some() {
            self.last_error = error;
        }
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }
}
