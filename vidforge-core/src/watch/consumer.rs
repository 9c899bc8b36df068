//! Drains the filesystem event stream and drives the catalog-update
//! pipeline. Idempotent under replay: a path can appear in the stream any
//! number of times and `CatalogUpdate::update` no-ops when nothing changed.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{FsEvent, STREAM_NAME};
use crate::catalog_update::CatalogUpdate;
use crate::error::Result;
use crate::kv::KvStore;

const BATCH_SIZE: usize = 200;
const EMPTY_BACKOFF: Duration = Duration::from_millis(500);
const CURSOR_KEY: &str = "fs-events:cursor";

/// Single-consumer loop over [`super::STREAM_NAME`]. Safe to restart at any
/// point: the cursor is persisted in the key/value store after each batch.
pub struct EventConsumer {
    kv: Arc<dyn KvStore>,
    catalog_update: Arc<CatalogUpdate>,
}

impl EventConsumer {
    pub fn new(kv: Arc<dyn KvStore>, catalog_update: Arc<CatalogUpdate>) -> Self {
        Self { kv, catalog_update }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.drain_once().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(EMPTY_BACKOFF) => {}
                    }
                }
                Err(err) => {
                    warn!(error = %err, "event consumer batch failed, retrying after backoff");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(EMPTY_BACKOFF) => {}
                    }
                }
            }
        }
    }

    /// Reads and processes one batch. Returns `true` if it was non-empty.
    async fn drain_once(&self) -> Result<bool> {
        let after_id = self.cursor().await?;
        let entries = self.kv.stream_read(STREAM_NAME, &after_id, BATCH_SIZE).await?;
        if entries.is_empty() {
            return Ok(false);
        }

        let mut last_id = after_id;
        for entry in &entries {
            match serde_json::from_slice::<FsEvent>(&entry.payload) {
                Ok(event) => {
                    debug!(path = %event.path, kind = ?event.kind, "processing fs event");
                    if let Err(err) = self.catalog_update.update(&event.path).await {
                        warn!(path = %event.path, error = %err, "catalog update failed for fs event");
                    }
                }
                Err(err) => warn!(error = %err, "failed to decode fs event payload, skipping"),
            }
            last_id = entry.id.clone();
        }

        self.kv.stream_trim_before(STREAM_NAME, &last_id).await?;
        self.set_cursor(&last_id).await?;
        Ok(true)
    }

    async fn cursor(&self) -> Result<String> {
        match self.kv.get(CURSOR_KEY).await? {
            Some(bytes) => Ok(String::from_utf8_lossy(&bytes).to_string()),
            None => Ok("0".to_string()),
        }
    }

    async fn set_cursor(&self, id: &str) -> Result<()> {
        self.kv.set(CURSOR_KEY, id.as_bytes(), None, false).await?;
        Ok(())
    }
}
