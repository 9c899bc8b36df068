//! Periodic, atomically-written status files under the configured output
//! directory. Nothing reads these back into the daemon; they exist purely
//! for external observability (dashboards, `cat`, a debugging shell).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::catalog::{Catalog, CandidateQuery};
use crate::error::Result;
use crate::resource::{ResourcePenalties, SystemMetrics};
use crate::scheduler::Scheduler;
use crate::types::{FileStatus, JobKind, RunningJob};
use vidforge_config::Settings;

const FILELIST_LIMIT: i64 = 200;

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|v| v.to_str()).unwrap_or("snapshot"),
        uuid::Uuid::now_v7()
    ));
    tokio::fs::write(&tmp_path, bytes).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

async fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

#[derive(Debug, Serialize)]
struct RunningJobView {
    #[serde(flatten)]
    job: RunningJob,
    kind: JobKind,
}

#[derive(Debug, Serialize)]
struct ActiveSnapshot {
    active: Vec<RunningJobView>,
    available_transcode_compute: f64,
    available_integrity_compute: f64,
    memory_penalty: f64,
    cpu_penalty: f64,
    refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct StatusSnapshot {
    status_counts: std::collections::BTreeMap<String, i64>,
    total_reclaimed_space: i64,
    refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct DiskEntry {
    path: String,
    total_bytes: u64,
    available_bytes: u64,
}

#[derive(Debug, Serialize)]
struct DiskSnapshot {
    sources: Vec<DiskEntry>,
    refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct UtilizationSnapshot {
    memory_used_pct: Option<f64>,
    cpu_load_ratio: Option<f64>,
    refreshed_at: DateTime<Utc>,
}

fn source_disk_usage(path: &Path) -> Option<(u64, u64)> {
    let stats = nix::sys::statvfs::statvfs(path).ok()?;
    let block_size = stats.fragment_size().max(1) as u64;
    let total_bytes = stats.blocks() as u64 * block_size;
    let available_bytes = stats.blocks_available() as u64 * block_size;
    Some((total_bytes, available_bytes))
}

/// Flushes the five output files on a timer. Each write is independent: a
/// failure on one file is logged and does not block the others.
pub struct SnapshotWriter {
    catalog: Arc<dyn Catalog>,
    transcode: Arc<Scheduler>,
    integrity: Arc<Scheduler>,
    penalties: ResourcePenalties,
    metrics: Arc<dyn SystemMetrics>,
    settings: Arc<Settings>,
}

impl SnapshotWriter {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        transcode: Arc<Scheduler>,
        integrity: Arc<Scheduler>,
        penalties: ResourcePenalties,
        metrics: Arc<dyn SystemMetrics>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            catalog,
            transcode,
            integrity,
            penalties,
            metrics,
            settings,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.flush_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.flush_all().await;
        }
    }

    async fn flush_all(&self) {
        if let Err(err) = self.flush_active().await {
            warn!(error = %err, "failed to write active.json");
        }
        if let Err(err) = self.flush_filelist().await {
            warn!(error = %err, "failed to write filelist.json");
        }
        if let Err(err) = self.flush_status().await {
            warn!(error = %err, "failed to write status.json");
        }
        if let Err(err) = self.flush_disk().await {
            warn!(error = %err, "failed to write disk.json");
        }
        if let Err(err) = self.flush_utilization().await {
            warn!(error = %err, "failed to write utilization.json");
        }
    }

    async fn flush_active(&self) -> Result<()> {
        let mut active: Vec<RunningJobView> = self
            .transcode
            .running_jobs()
            .await
            .into_iter()
            .map(|job| RunningJobView { job, kind: JobKind::Transcode })
            .collect();
        active.extend(
            self.integrity
                .running_jobs()
                .await
                .into_iter()
                .map(|job| RunningJobView { job, kind: JobKind::Integrity }),
        );

        let snapshot = ActiveSnapshot {
            active,
            available_transcode_compute: self.transcode.available_compute().await,
            available_integrity_compute: self.integrity.available_compute().await,
            memory_penalty: self.penalties.memory_penalty(),
            cpu_penalty: self.penalties.cpu_penalty(),
            refreshed_at: Utc::now(),
        };
        write_json(&self.output_path("active.json"), &snapshot).await
    }

    async fn flush_filelist(&self) -> Result<()> {
        let query = CandidateQuery {
            status: Some(FileStatus::Pending),
            limit: FILELIST_LIMIT,
            ..Default::default()
        };
        let filelist = self.catalog.find(&query).await?;
        write_json(&self.output_path("filelist.json"), &filelist).await
    }

    async fn flush_status(&self) -> Result<()> {
        let counts = self.catalog.status_counts().await?;
        let status_counts = counts
            .into_iter()
            .map(|(status, count)| (format!("{status:?}").to_lowercase(), count))
            .collect();
        let snapshot = StatusSnapshot {
            status_counts,
            total_reclaimed_space: self.catalog.total_reclaimed_space().await?,
            refreshed_at: Utc::now(),
        };
        write_json(&self.output_path("status.json"), &snapshot).await
    }

    async fn flush_disk(&self) -> Result<()> {
        let sources = self
            .settings
            .sources
            .iter()
            .filter_map(|source| {
                let (total_bytes, available_bytes) = source_disk_usage(&source.path)?;
                Some(DiskEntry {
                    path: source.path.display().to_string(),
                    total_bytes,
                    available_bytes,
                })
            })
            .collect();
        let snapshot = DiskSnapshot { sources, refreshed_at: Utc::now() };
        write_json(&self.output_path("disk.json"), &snapshot).await
    }

    async fn flush_utilization(&self) -> Result<()> {
        let snapshot = UtilizationSnapshot {
            memory_used_pct: self.metrics.memory_used_pct().ok(),
            cpu_load_ratio: self.metrics.cpu_load_ratio().ok(),
            refreshed_at: Utc::now(),
        };
        write_json(&self.output_path("utilization.json"), &snapshot).await
    }

    fn output_path(&self, file_name: &str) -> PathBuf {
        self.settings.output_dir.join(file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_atomic_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        write_atomic(&path, b"{}").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"{}");
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }
}
