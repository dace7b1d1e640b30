use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub String);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a stored file came from. Doubles as the storage-name prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Upload,
    Transformation,
}

impl FileKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Transformation => "transformation",
        }
    }

    pub fn from_storage_name(name: &str) -> Option<Self> {
        let (prefix, _) = name.split_once('_')?;
        match prefix {
            "upload" => Some(Self::Upload),
            "transformation" => Some(Self::Transformation),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Uploaded,
    Invalid,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub id: FileId,
    pub original_name: String,
    pub storage_path: PathBuf,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
    pub status: FileStatus,
    pub kind: FileKind,
}

impl FileRef {
    pub fn is_usable(&self) -> bool {
        self.status == FileStatus::Uploaded
    }
}
