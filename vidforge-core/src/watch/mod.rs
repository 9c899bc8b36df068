//! Recursive filesystem watcher. Raw `notify` events are filtered, debounced
//! per path, and appended to a durable key/value stream; a separate
//! [`consumer`] drains that stream and drives the catalog-update pipeline.
//! Splitting detection from processing this way means a crash between the
//! two loses nothing: the stream is append-only and the consumer resumes
//! from its last trimmed position.

pub mod consumer;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, VidforgeError};
use crate::kv::KvStore;
use vidforge_config::Settings;

pub const STREAM_NAME: &str = "fs-events";

/// Minimum time between forwarded events for the same path.
const DEBOUNCE_WINDOW: Duration = Duration::from_secs(10);

const TRASH_DIR_NAME: &str = ".trash";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FsEventKind {
    Created,
    Modified,
    Removed,
}

/// The durable payload appended to the event stream. `kind` is informational
/// only: the catalog-update pipeline re-derives truth from the filesystem
/// regardless of which kind triggered it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: String,
    pub detected_at: chrono::DateTime<chrono::Utc>,
}

fn is_ignored_component(component: &str) -> bool {
    component == TRASH_DIR_NAME || component.starts_with('.')
}

fn path_contains_ignored_dir(path: &Path) -> bool {
    path.components().any(|c| match c {
        std::path::Component::Normal(os) => os.to_str().map(is_ignored_component).unwrap_or(false),
        _ => false,
    })
}

fn has_watched_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

fn classify_event(event: &Event) -> Option<FsEventKind> {
    match event.kind {
        EventKind::Create(_) => Some(FsEventKind::Created),
        EventKind::Modify(_) => Some(FsEventKind::Modified),
        EventKind::Remove(_) => Some(FsEventKind::Removed),
        _ => None,
    }
}

/// Owns the live `notify` watcher handles; dropping this stops watching.
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
    debounce_task: tokio::task::JoinHandle<()>,
}

impl FsWatcher {
    /// Starts watching every configured source path and spawns the
    /// debounce-and-append task. The caller owns the returned handle for
    /// as long as watching should continue.
    pub fn spawn(settings: Arc<Settings>, kv: Arc<dyn KvStore>, shutdown: CancellationToken) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        debug!("fs watcher channel closed, dropping event");
                    }
                }
                Err(err) => error!(error = %err, "notify watcher error"),
            },
            notify::Config::default(),
        )
        .map_err(|e| VidforgeError::Internal(format!("failed to create file watcher: {e}")))?;

        for source in &settings.sources {
            match watcher.watch(&source.path, RecursiveMode::Recursive) {
                Ok(()) => info!(path = %source.path.display(), "watching source"),
                Err(err) => warn!(path = %source.path.display(), error = %err, "failed to watch source"),
            }
        }

        let debounce_task = tokio::spawn(debounce_and_append(rx, kv, settings, shutdown));

        Ok(Self {
            _watcher: watcher,
            debounce_task,
        })
    }

    pub async fn join(self) {
        let _ = self.debounce_task.await;
    }
}

async fn debounce_and_append(
    mut rx: mpsc::UnboundedReceiver<Event>,
    kv: Arc<dyn KvStore>,
    settings: Arc<Settings>,
    shutdown: CancellationToken,
) {
    let mut last_emitted: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let Some(kind) = classify_event(&event) else { continue };
        let Some(path) = event.paths.first().cloned() else { continue };

        if path_contains_ignored_dir(&path) {
            continue;
        }
        if kind != FsEventKind::Removed && !has_watched_extension(&path, &settings.file_ext) {
            continue;
        }

        let now = Instant::now();
        if let Some(last) = last_emitted.get(&path) {
            if now.duration_since(*last) < DEBOUNCE_WINDOW {
                continue;
            }
        }
        last_emitted.insert(path.clone(), now);

        let fs_event = FsEvent {
            kind,
            path: path.display().to_string(),
            detected_at: chrono::Utc::now(),
        };
        let payload = match serde_json::to_vec(&fs_event) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "failed to serialize fs event");
                continue;
            }
        };
        if let Err(err) = kv.stream_add(STREAM_NAME, &payload).await {
            error!(path = %fs_event.path, error = %err, "failed to append fs event to stream");
        }

        // Bound memory: drop stale debounce entries once the map grows large.
        if last_emitted.len() > 100_000 {
            let cutoff = now - DEBOUNCE_WINDOW;
            last_emitted.retain(|_, seen| *seen > cutoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trash_subtree_is_ignored() {
        assert!(path_contains_ignored_dir(Path::new("/media/show/.trash/episode.mkv")));
        assert!(!path_contains_ignored_dir(Path::new("/media/show/episode.mkv")));
    }

    #[test]
    fn hidden_directories_are_ignored() {
        assert!(path_contains_ignored_dir(Path::new("/media/.staging/episode.mkv")));
    }

    #[test]
    fn extension_filter_matches_case_insensitively() {
        let extensions = vec!["mkv".to_string(), "mp4".to_string()];
        assert!(has_watched_extension(Path::new("/a/b.MKV"), &extensions));
        assert!(!has_watched_extension(Path::new("/a/b.srt"), &extensions));
    }
}
