pub mod postgres;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{FileId, FileRecord, FileStatus, JobDescriptor};

pub use postgres::PgCatalog;

/// Direction to sort the secondary candidate-ordering fields in: sorted
/// first by eligibility, then by size and width, with direction varying
/// per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Predicate used by both the candidate generator and housekeeping sweeps.
/// Kept as explicit fields rather than a generic query language, favoring
/// explicit projection queries over an ad-hoc filter DSL.
#[derive(Debug, Clone, Default)]
pub struct CandidateQuery {
    pub status: Option<FileStatus>,
    /// `encode_version != value`, used by the transcode queue.
    pub encode_version_ne: Option<String>,
    /// `integrity_checked == value`, used by the integrity queue.
    pub integrity_checked: Option<bool>,
    pub exclude_ids: Vec<FileId>,
    pub size_sort: SortDirection,
    pub width_sort: SortDirection,
    pub limit: i64,
}

impl Default for SortDirection {
    fn default() -> Self {
        SortDirection::Ascending
    }
}

/// A partial update to a File record. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct FileUpdate {
    pub status: Option<FileStatus>,
    pub encode_version: Option<String>,
    pub probe: Option<Option<serde_json::Value>>,
    pub last_probe_at: Option<chrono::DateTime<chrono::Utc>>,
    pub file_hash: Option<String>,
    pub audio_language: Option<Vec<String>>,
    pub integrity_checked: Option<bool>,
    pub compute_score: Option<f64>,
    pub permit_hw_decode: Option<bool>,
    pub reclaimed_space: Option<i64>,
    pub indexer_data: Option<Option<serde_json::Value>>,
    pub priority: Option<i32>,
    pub size_bytes: Option<i64>,
    pub width: Option<i32>,
    pub error: Option<Option<serde_json::Value>>,
}

/// One unit of work in a bulk write.
#[derive(Debug, Clone)]
pub enum BulkOp {
    Update { id: FileId, patch: FileUpdate },
    Delete { id: FileId },
}

/// A structured failure appended to the append-only error log.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorLogEntry {
    pub path: String,
    pub reason: String,
    pub stderr_tail: Vec<String>,
    pub cmdline: Option<String>,
    pub trace: Option<String>,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
}

/// The document-store contract, kept intentionally small:
/// `find`, `find_one`, `count`, `update_one`, `update_many`, `bulk_write`,
/// `delete_many`, plus the two append-only error collections.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Lean, projected query used by the candidate generator: no full
    /// records are materialized.
    async fn find(&self, query: &CandidateQuery) -> Result<Vec<JobDescriptor>>;

    async fn find_one(&self, id: FileId) -> Result<Option<FileRecord>>;

    async fn find_one_by_path(&self, path: &str) -> Result<Option<FileRecord>>;

    async fn count(&self, query: &CandidateQuery) -> Result<i64>;

    async fn insert(&self, record: &FileRecord) -> Result<()>;

    async fn update_one(&self, id: FileId, patch: &FileUpdate) -> Result<()>;

    async fn update_many(&self, query: &CandidateQuery, patch: &FileUpdate) -> Result<u64>;

    async fn bulk_write(&self, ops: Vec<BulkOp>) -> Result<()>;

    async fn delete_many(&self, query: &CandidateQuery) -> Result<u64>;

    /// Counts grouped by status, used by the status snapshot.
    async fn status_counts(&self) -> Result<Vec<(FileStatus, i64)>>;

    /// Sum of `reclaimed_space` across all records, used by the status
    /// snapshot.
    async fn total_reclaimed_space(&self) -> Result<i64>;

    async fn append_error(&self, entry: &ErrorLogEntry) -> Result<()>;

    async fn append_integrity_error(&self, entry: &ErrorLogEntry) -> Result<()>;
}
