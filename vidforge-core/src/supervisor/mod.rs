pub mod argv;
pub mod corruption;
pub mod progress;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{BulkOp, Catalog, ErrorLogEntry, FileUpdate};
use crate::catalog_update::CatalogUpdate;
use crate::error::{Result, VidforgeError};
use crate::integrity::{IntegrityChecker, IntegrityOutcome};
use crate::scheduler::{JobRunner, RunningSet};
use crate::types::{ErrorInfo, FileId, FileRecord, FileStatus, JobAction, JobDescriptor};
use corruption::Classification;
use progress::{compute_eta_secs, compute_percent, format_timemark, ProgressParser};
use vidforge_config::Settings;

/// Outcome of one encoder child run: its exit status and the last N lines
/// of stderr.
struct ChildRun {
    status: std::process::ExitStatus,
    stderr_tail: Vec<String>,
}

fn slug_for(path: &Path) -> String {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    stem.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

fn find_source_config<'a>(settings: &'a Settings, path: &Path) -> Option<&'a vidforge_config::SourceConfig> {
    settings.sources.iter().find(|s| path.starts_with(&s.path))
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

async fn kill_process(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .map_err(|e| VidforgeError::Internal(format!("failed to signal pid {pid}: {e}")))?;
    }
    #[cfg(windows)]
    {
        tokio::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .status()
            .await?;
    }
    Ok(())
}

/// Reads the encoder's `-progress pipe:1` stream and patches the running-job
/// entry, deduplicating by timemark string.
async fn pump_progress(
    stdout: tokio::process::ChildStdout,
    running: RunningSet,
    file_id: FileId,
    total_frames: Option<u64>,
    duration_secs: f64,
) {
    let mut parser = ProgressParser::new();
    let mut lines = BufReader::new(stdout).lines();
    let started = tokio::time::Instant::now();
    let mut last_timemark = String::new();

    while let Ok(Some(line)) = lines.next_line().await {
        let Some(sample) = parser.feed(&line) else { continue };
        let timemark = format_timemark(sample.out_time_secs.unwrap_or(0.0));
        if timemark == last_timemark {
            continue;
        }
        last_timemark = timemark.clone();

        let percent = compute_percent(&sample, total_frames, duration_secs);
        let eta_secs = compute_eta_secs(percent, started.elapsed().as_secs_f64());

        if let Some(job) = running.write().await.get_mut(&file_id) {
            job.percent = percent;
            job.current_fps = sample.fps.unwrap_or(0.0);
            job.current_kbps = sample.bitrate_kbps.unwrap_or(0.0);
            job.timemark = timemark;
            job.eta_secs = eta_secs;
            job.size_progress_bytes = sample.total_size_bytes.unwrap_or(0);
            job.touch();
        }
    }
}

/// Keeps only the last `cap` lines of the encoder's stderr regardless of how
/// verbose it is.
async fn pump_stderr(stderr: tokio::process::ChildStderr, cap: usize) -> Vec<String> {
    let mut ring: VecDeque<String> = VecDeque::with_capacity(cap.min(1024));
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if ring.len() == cap {
            ring.pop_front();
        }
        ring.push_back(line);
    }
    ring.into_iter().collect()
}

async fn touch_destination(path: &Path) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_modified(std::time::SystemTime::now())
    })
    .await
    .map_err(|e| VidforgeError::Internal(format!("touch task panicked: {e}")))??;
    Ok(())
}

async fn promote(scratch: &Path, destination: &Path, running: &RunningSet, file_id: FileId) -> Result<()> {
    if let Some(job) = running.write().await.get_mut(&file_id) {
        job.action = JobAction::Finalizing;
        job.percent = 0.0;
        job.touch();
    }
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(scratch, destination).await.is_err() {
        tokio::fs::copy(scratch, destination).await?;
        tokio::fs::remove_file(scratch).await?;
    }
    if let Some(job) = running.write().await.get_mut(&file_id) {
        job.percent = 100.0;
        job.touch();
    }
    Ok(())
}

/// Runs one source-file transcode to completion with predictable memory and
/// partial-failure behavior: validate, integrity-preflight, optional stage
/// copy, plan, spawn, promote-or-record-failure.
pub struct Supervisor {
    catalog: Arc<dyn Catalog>,
    settings: Arc<Settings>,
    integrity: Arc<IntegrityChecker>,
    catalog_update: Arc<CatalogUpdate>,
    encoder_path: String,
}

impl Supervisor {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        settings: Arc<Settings>,
        integrity: Arc<IntegrityChecker>,
        catalog_update: Arc<CatalogUpdate>,
    ) -> Self {
        Self {
            catalog,
            settings,
            integrity,
            catalog_update,
            encoder_path: "ffmpeg".to_string(),
        }
    }

    async fn run_inner(
        &self,
        descriptor: &JobDescriptor,
        running: &RunningSet,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let Some(mut record) = self.catalog.find_one(descriptor.id).await? else {
            return Ok(());
        };

        let source_path = PathBuf::from(&record.path);
        if tokio::fs::metadata(&source_path).await.is_err() {
            self.catalog
                .update_one(record.id, &FileUpdate { status: Some(FileStatus::Deleted), ..Default::default() })
                .await?;
            return Ok(());
        }

        if record.probe.as_ref().and_then(|p| p.encode_version_tag.as_deref())
            == Some(self.settings.encode_version.as_str())
        {
            self.catalog
                .update_one(record.id, &FileUpdate { status: Some(FileStatus::Complete), ..Default::default() })
                .await?;
            return Ok(());
        }

        if !record.integrity_checked {
            if let Some(job) = running.write().await.get_mut(&descriptor.id) {
                job.action = JobAction::Integrity;
                job.touch();
            }
            let outcome = tokio::time::timeout(self.settings.preflight_timeout, self.integrity.check_file(&record))
                .await
                .map_err(|_| VidforgeError::Internal("integrity preflight timed out".to_string()))??;
            match outcome {
                IntegrityOutcome::Clean => record.integrity_checked = true,
                IntegrityOutcome::Corrupt
                | IntegrityOutcome::HardwareDecodeInit
                | IntegrityOutcome::LockContended => return Ok(()),
            }
        }

        let Some(probe) = record.probe.clone() else {
            return Err(VidforgeError::Planner("no probe data for file".to_string()));
        };

        let source_config = find_source_config(&self.settings, &source_path)
            .ok_or_else(|| VidforgeError::Internal(format!("no configured source for {}", record.path)))?;

        let ext = source_path.extension().and_then(|e| e.to_str()).unwrap_or("mkv");
        let slug = slug_for(&source_path);

        let working_input = if let Some(stage_dir) = &source_config.stage_path {
            let stage_file = stage_dir.join(format!("{slug}_stage.{ext}"));
            self.stage_copy(&source_path, &stage_file, running, descriptor.id).await?;
            stage_file
        } else {
            source_path.clone()
        };

        let instructions = crate::planner::plan(&probe, &record.audio_language, "hevc")?;

        let scratch_output = source_config.scratch.join(format!("{slug}.{ext}"));
        if let Some(parent) = scratch_output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let argv = argv::build_argv(
            &working_input,
            &scratch_output,
            &instructions,
            &self.settings.encode_version,
            record.permit_hw_decode,
        );
        let cmdline = format!("{} {}", self.encoder_path, argv.join(" "));

        let total_frames = probe.total_frames();
        let duration_secs = probe.duration_secs;

        let child_run = self
            .spawn_encoder(&argv, running, descriptor.id, total_frames, duration_secs, cmdline.clone(), shutdown)
            .await?;

        if shutdown.is_cancelled() {
            tokio::fs::remove_file(&scratch_output).await.ok();
            return Ok(());
        }

        if child_run.status.success() {
            self.on_success(&record, &scratch_output, &source_path, probe.size_bytes, running, descriptor.id)
                .await
        } else {
            self.on_failure(&record, &scratch_output, &cmdline, child_run).await
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn spawn_encoder(
        &self,
        argv: &[String],
        running: &RunningSet,
        file_id: FileId,
        total_frames: Option<u64>,
        duration_secs: f64,
        cmdline: String,
        shutdown: &CancellationToken,
    ) -> Result<ChildRun> {
        let mut child = tokio::process::Command::new(&self.encoder_path)
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = child.id();
        if let Some(job) = running.write().await.get_mut(&file_id) {
            job.action = JobAction::Transcoding;
            job.pid = pid;
            job.cmdline = cmdline;
            job.touch();
        }

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let ring_lines = self.settings.stderr_ring_lines;

        let progress_task = tokio::spawn(pump_progress(stdout, running.clone(), file_id, total_frames, duration_secs));
        let stderr_task = tokio::spawn(pump_stderr(stderr, ring_lines));

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = shutdown.cancelled() => {
                if let Some(pid) = pid {
                    let _ = kill_process(pid).await;
                }
                child.wait().await?
            }
        };

        progress_task.abort();
        let stderr_tail = stderr_task.await.unwrap_or_default();

        Ok(ChildRun { status, stderr_tail })
    }

    /// Copies the source into the staging directory, skipping the copy if a
    /// same-size stage file is already present.
    async fn stage_copy(&self, source: &Path, stage_path: &Path, running: &RunningSet, file_id: FileId) -> Result<()> {
        let total = tokio::fs::metadata(source).await?.len();
        if let Ok(meta) = tokio::fs::metadata(stage_path).await {
            if meta.len() == total {
                return Ok(());
            }
        }
        if let Some(parent) = stage_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Some(job) = running.write().await.get_mut(&file_id) {
            job.action = JobAction::Staging;
            job.percent = 0.0;
            job.touch();
        }

        let copy = async {
            let mut src = tokio::fs::File::open(source).await?;
            let mut dst = tokio::fs::File::create(stage_path).await?;
            let mut buf = vec![0u8; 8 * 1024 * 1024];
            let mut copied: u64 = 0;
            let mut last_report = tokio::time::Instant::now();
            loop {
                let read = src.read(&mut buf).await?;
                if read == 0 {
                    break;
                }
                dst.write_all(&buf[..read]).await?;
                copied += read as u64;
                if last_report.elapsed() >= Duration::from_secs(1) {
                    let percent = if total > 0 { (copied as f64 / total as f64) * 100.0 } else { 0.0 };
                    if let Some(job) = running.write().await.get_mut(&file_id) {
                        job.percent = percent;
                        job.size_progress_bytes = copied;
                        job.touch();
                    }
                    last_report = tokio::time::Instant::now();
                }
            }
            dst.flush().await?;
            Ok::<(), VidforgeError>(())
        };

        tokio::time::timeout(self.settings.stage_timeout, copy)
            .await
            .map_err(|_| VidforgeError::Internal("stage copy timed out".to_string()))??;
        Ok(())
    }

    async fn on_success(
        &self,
        record: &FileRecord,
        scratch_output: &Path,
        source_path: &Path,
        original_size: u64,
        running: &RunningSet,
        file_id: FileId,
    ) -> Result<()> {
        let meta = tokio::fs::metadata(scratch_output).await.map_err(|_| VidforgeError::Encoder {
            job_id: file_id.to_string(),
            reason: "scratch output missing after successful encode".to_string(),
        })?;
        if meta.len() == 0 {
            return Err(VidforgeError::Encoder {
                job_id: file_id.to_string(),
                reason: "scratch output is empty".to_string(),
            });
        }

        let destination = PathBuf::from(&record.path);
        promote(scratch_output, &destination, running, file_id).await?;
        touch_destination(&destination).await?;

        if destination != source_path {
            tokio::fs::remove_file(source_path).await.ok();
        }

        let destination_str = destination.display().to_string();
        self.catalog_update.update(&destination_str).await?;

        let new_size = tokio::fs::metadata(&destination).await.map(|m| m.len()).unwrap_or(original_size);
        let reclaimed = original_size.saturating_sub(new_size) as i64;
        if reclaimed > 0 {
            if let Some(updated) = self.catalog.find_one_by_path(&destination_str).await? {
                let patch = FileUpdate {
                    reclaimed_space: Some(updated.reclaimed_space + reclaimed),
                    ..Default::default()
                };
                self.catalog.update_one(updated.id, &patch).await?;
            }
        }
        info!(path = %record.path, "transcode completed and promoted");
        Ok(())
    }

    async fn on_failure(
        &self,
        record: &FileRecord,
        scratch_output: &Path,
        cmdline: &str,
        child_run: ChildRun,
    ) -> Result<()> {
        let exit_code = child_run.status.code();
        let signal = unix_signal(&child_run.status);
        let classification = corruption::classify(&child_run.stderr_tail, exit_code, signal);

        tokio::fs::remove_file(scratch_output).await.ok();

        match classification {
            Classification::Corrupt => {
                self.trash_source(&record.path).await;
                self.catalog.bulk_write(vec![BulkOp::Delete { id: record.id }]).await?;
                warn!(path = %record.path, "source corrupt, trashed and removed from catalog");
            }
            Classification::HardwareDecodeInit => {
                let patch = FileUpdate { permit_hw_decode: Some(false), ..Default::default() };
                self.catalog.update_one(record.id, &patch).await?;
                warn!(path = %record.path, "hardware decode init failed, retrying with software decode next attempt");
            }
            Classification::Generic => {
                let reason = format!("encoder exited with status {:?}", child_run.status);
                let error_info = ErrorInfo {
                    reason: reason.clone(),
                    stderr_tail: child_run.stderr_tail.clone(),
                    cmdline: Some(cmdline.to_string()),
                    occurred_at: chrono::Utc::now(),
                };
                let patch = FileUpdate {
                    error: Some(Some(serde_json::to_value(&error_info)?)),
                    ..Default::default()
                };
                self.catalog.update_one(record.id, &patch).await?;
                self.catalog
                    .append_error(&ErrorLogEntry {
                        path: record.path.clone(),
                        reason,
                        stderr_tail: child_run.stderr_tail,
                        cmdline: Some(cmdline.to_string()),
                        trace: None,
                        occurred_at: chrono::Utc::now(),
                    })
                    .await?;
                warn!(path = %record.path, "transcode failed");
            }
        }
        Ok(())
    }

    async fn trash_source(&self, path: &str) {
        let source = Path::new(path);
        if let Some(parent) = source.parent() {
            let trash_dir = parent.join(".trash");
            if tokio::fs::create_dir_all(&trash_dir).await.is_ok() {
                if let Some(name) = source.file_name() {
                    let _ = tokio::fs::rename(source, trash_dir.join(name)).await;
                }
            }
        }
    }
}

#[async_trait]
impl JobRunner for Supervisor {
    async fn run(&self, descriptor: JobDescriptor, running: RunningSet, shutdown: CancellationToken) {
        if let Err(err) = self.run_inner(&descriptor, &running, &shutdown).await {
            warn!(file_id = %descriptor.id, error = %err, "transcode job failed");
        }
        running.write().await.remove(&descriptor.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_sanitizes_non_alphanumeric_characters() {
        assert_eq!(slug_for(Path::new("/media/Some Movie (2020).mkv")), "some_movie__2020_");
    }

    #[test]
    fn slug_falls_back_when_no_stem() {
        assert_eq!(slug_for(Path::new("/")), "file");
    }
}
