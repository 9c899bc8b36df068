//! Decode-only verification pass: runs the encoder in validate mode (decode
//! every stream, discard the output) and inspects stderr for corruption.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{Catalog, ErrorLogEntry, FileUpdate};
use crate::error::Result;
use crate::kv::{KvStore, NamedLock};
use crate::scheduler::{JobRunner, RunningSet};
use crate::supervisor::corruption::{self, Classification};
use crate::types::{FileRecord, JobAction, JobDescriptor};
use vidforge_config::Settings;

const FILE_LOCK_TTL: Duration = Duration::from_secs(3600);

/// Outcome of a single decode-only check, kept separate from the `JobRunner`
/// plumbing so the supervisor's preflight step can call it directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityOutcome {
    Clean,
    Corrupt,
    HardwareDecodeInit,
    LockContended,
}

pub struct IntegrityChecker {
    catalog: Arc<dyn Catalog>,
    kv: Arc<dyn KvStore>,
    settings: Arc<Settings>,
    concurrency: Arc<Semaphore>,
    encoder_path: String,
}

impl IntegrityChecker {
    pub fn new(catalog: Arc<dyn Catalog>, kv: Arc<dyn KvStore>, settings: Arc<Settings>) -> Self {
        let permits = settings.concurrent_integrity_checks.max(1);
        Self {
            catalog,
            kv,
            concurrency: Arc::new(Semaphore::new(permits)),
            settings,
            encoder_path: "ffmpeg".to_string(),
        }
    }

    /// Runs a decode-only pass over `record`'s source file and reconciles
    /// the catalog. Acquires a per-file lock so at most one worker ever
    /// checks the same file at once; a contended lock is a silent no-op.
    pub async fn check_file(&self, record: &FileRecord) -> Result<IntegrityOutcome> {
        let lock_key = format!("integrity:{}", record.path);
        let lock = match NamedLock::try_acquire(self.kv.as_ref(), &lock_key, FILE_LOCK_TTL).await? {
            Some(lock) => lock,
            None => return Ok(IntegrityOutcome::LockContended),
        };

        let _permit = self.concurrency.acquire().await;
        let run = run_decode_check(&self.encoder_path, &record.path).await;

        let outcome = match run {
            Ok(stderr_tail) => {
                let residual = corruption::residual_errors(&stderr_tail);
                if residual.is_empty() {
                    IntegrityOutcome::Clean
                } else {
                    match corruption::classify(&stderr_tail, None, None) {
                        Classification::HardwareDecodeInit => IntegrityOutcome::HardwareDecodeInit,
                        _ => IntegrityOutcome::Corrupt,
                    }
                }
            }
            Err(err) => {
                warn!(path = %record.path, error = %err, "integrity decode pass failed to spawn");
                IntegrityOutcome::Corrupt
            }
        };

        self.apply_outcome(record, &outcome).await?;

        if let Err(err) = lock.release().await {
            warn!(path = %record.path, error = %err, "failed to release integrity lock");
        }
        Ok(outcome)
    }

    async fn apply_outcome(&self, record: &FileRecord, outcome: &IntegrityOutcome) -> Result<()> {
        match outcome {
            IntegrityOutcome::Clean => {
                let patch = FileUpdate {
                    integrity_checked: Some(true),
                    ..Default::default()
                };
                self.catalog.update_one(record.id, &patch).await?;
                info!(path = %record.path, "integrity check passed");
            }
            IntegrityOutcome::Corrupt => {
                self.trash_and_forget(record).await?;
            }
            IntegrityOutcome::HardwareDecodeInit => {
                let patch = FileUpdate {
                    permit_hw_decode: Some(false),
                    ..Default::default()
                };
                self.catalog.update_one(record.id, &patch).await?;
                warn!(path = %record.path, "hardware decode init failed, falling back to software decode");
            }
            IntegrityOutcome::LockContended => {}
        }
        Ok(())
    }

    /// Moves the source into a sibling trash subtree and appends an
    /// integrity-error record. Leaves the catalog record itself alone: the
    /// rename makes the original path disappear, which the watcher and
    /// catalog-update pipeline pick up as a delete on their own.
    async fn trash_and_forget(&self, record: &FileRecord) -> Result<()> {
        let source = std::path::Path::new(&record.path);
        if let Some(parent) = source.parent() {
            let trash_dir = parent.join(".trash");
            tokio::fs::create_dir_all(&trash_dir).await.ok();
            if let Some(name) = source.file_name() {
                let _ = tokio::fs::rename(source, trash_dir.join(name)).await;
            }
        }
        self.catalog
            .append_integrity_error(&ErrorLogEntry {
                path: record.path.clone(),
                reason: "decode-only verification found corruption".to_string(),
                stderr_tail: vec![],
                cmdline: None,
                trace: None,
                occurred_at: chrono::Utc::now(),
            })
            .await?;
        warn!(path = %record.path, "source failed integrity check, trashed");
        Ok(())
    }
}

/// Runs the encoder in decode-all-streams-discard-output mode and returns
/// its bounded stderr tail.
async fn run_decode_check(encoder_path: &str, path: &str) -> Result<Vec<String>> {
    let mut child = tokio::process::Command::new(encoder_path)
        .args(["-v", "error", "-i", path, "-map", "0", "-f", "null", "-"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let stderr = child.stderr.take().expect("stderr piped");
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        tail.push(line);
    }
    child.wait().await?;
    Ok(tail)
}

#[async_trait]
impl JobRunner for IntegrityChecker {
    async fn run(&self, descriptor: JobDescriptor, running: RunningSet, _shutdown: CancellationToken) {
        if let Some(job) = running.write().await.get_mut(&descriptor.id) {
            job.action = JobAction::Integrity;
            job.touch();
        }

        let record = match self.catalog.find_one(descriptor.id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                running.write().await.remove(&descriptor.id);
                return;
            }
            Err(err) => {
                warn!(file_id = %descriptor.id, error = %err, "could not load record for integrity check");
                running.write().await.remove(&descriptor.id);
                return;
            }
        };

        if let Err(err) = self.check_file(&record).await {
            warn!(path = %record.path, error = %err, "integrity check errored");
        }

        running.write().await.remove(&descriptor.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_decode_with_no_residual_errors() {
        let stderr: Vec<String> = vec!["configuration: --enable-gpl".to_string()];
        assert!(corruption::residual_errors(&stderr).is_empty());
    }
}
