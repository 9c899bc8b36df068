use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::FileId;
use super::record::SortFields;

/// Which of the two scheduler pools a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Transcode,
    Integrity,
}

/// Lean projection of a File record handed to the scheduler. The supervisor
/// loads the full record only once the job is admitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: FileId,
    pub path: String,
    pub compute_score: f64,
    pub sort_fields: SortFields,
}

/// Stage a running job is currently in. Mirrors the supervisor's state
/// machine; `Integrity` covers the decode-only verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Preflight,
    Staging,
    Transcoding,
    Finalizing,
    Integrity,
}

impl JobAction {
    /// Whether this stage contends with disk I/O heavily enough that the
    /// scheduler should refrain from admitting new work this pass.
    pub fn is_io_stage(self) -> bool {
        matches!(self, JobAction::Staging | JobAction::Finalizing)
    }
}

/// Ephemeral, mutated only by the supervisor task that owns it. The
/// scheduler driver only ever reads a cloned snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningJob {
    pub id: FileId,
    pub path: String,
    pub compute_score: f64,
    pub sort_fields: SortFields,
    pub action: JobAction,
    pub pid: Option<u32>,
    pub percent: f64,
    pub current_fps: f64,
    pub current_kbps: f64,
    pub timemark: String,
    pub eta_secs: Option<f64>,
    pub size_progress_bytes: u64,
    pub refreshed_at: DateTime<Utc>,
    pub cmdline: String,
}

impl RunningJob {
    pub fn from_descriptor(descriptor: &JobDescriptor, action: JobAction, cmdline: String) -> Self {
        Self {
            id: descriptor.id,
            path: descriptor.path.clone(),
            compute_score: descriptor.compute_score,
            sort_fields: descriptor.sort_fields,
            action,
            pid: None,
            percent: 0.0,
            current_fps: 0.0,
            current_kbps: 0.0,
            timemark: String::new(),
            eta_secs: None,
            size_progress_bytes: 0,
            refreshed_at: Utc::now(),
            cmdline,
        }
    }

    pub fn touch(&mut self) {
        self.refreshed_at = Utc::now();
    }

    /// A running-job entry not refreshed for this long is considered
    /// stalled and evicted from the in-memory set.
    pub fn is_stalled(&self, now: DateTime<Utc>, stall_after: chrono::Duration) -> bool {
        now - self.refreshed_at > stall_after
    }
}
