use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::FileId;
use super::probe::ProbeResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Complete,
    Deleted,
    Error,
    Ignore,
}

/// Last recorded failure for a file, kept bounded (stderr tail truncated by
/// the supervisor before it is ever stored here).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub reason: String,
    pub stderr_tail: Vec<String>,
    pub cmdline: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// The three fields the candidate generator sorts and projects on. Kept as
/// its own type since it is copied verbatim into [`crate::types::job::JobDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SortFields {
    /// Lower is more important.
    pub priority: i32,
    pub size: u64,
    pub width: u32,
}

/// Canonical catalog entry for one source path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub path: String,
    pub status: FileStatus,
    pub encode_version: String,
    pub probe: Option<ProbeResult>,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub file_hash: Option<String>,
    pub audio_language: BTreeSet<String>,
    pub integrity_checked: bool,
    pub compute_score: f64,
    pub permit_hw_decode: bool,
    pub reclaimed_space: i64,
    pub indexer_data: Option<serde_json::Value>,
    pub sort_fields: SortFields,
    pub error: Option<ErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Minimum compute score a record may carry; the planner's rounding floor.
pub const MIN_COMPUTE_SCORE: f64 = 0.125;

impl FileRecord {
    pub fn new(path: String, priority_default: i32) -> Self {
        let now = Utc::now();
        Self {
            id: FileId::new(),
            path,
            status: FileStatus::Pending,
            encode_version: String::new(),
            probe: None,
            last_probe_at: None,
            file_hash: None,
            audio_language: BTreeSet::new(),
            integrity_checked: false,
            compute_score: MIN_COMPUTE_SCORE,
            permit_hw_decode: true,
            reclaimed_space: 0,
            indexer_data: None,
            sort_fields: SortFields {
                priority: priority_default,
                size: 0,
                width: 0,
            },
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_complete_for(&self, target_encode_version: &str) -> bool {
        self.status == FileStatus::Complete && self.encode_version == target_encode_version
    }
}
