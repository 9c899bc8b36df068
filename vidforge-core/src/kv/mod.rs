pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use redis_store::RedisKv;

/// One entry read back from an append-only stream: its id (opaque,
/// monotonically ordered) and payload.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub payload: Vec<u8>,
}

/// The key/value store contract: `get`, `set` (with TTL and an optional
/// "only if absent" guard used for locks), `del`, plus an append-only
/// stream (`add`, `read`, `trim`) backing the filesystem event log.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Sets `key` to `value`. If `ttl` is given the key expires after that
    /// duration. If `if_not_exists` is true, the write only happens when
    /// the key is absent; the return value reports whether the write took
    /// effect (used for lock acquisition).
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        if_not_exists: bool,
    ) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Deletes `key` only if its current value equals `expected` (compare-
    /// and-delete, used to release a lock without clobbering a holder that
    /// has since re-acquired it after TTL expiry).
    async fn del_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool>;

    async fn stream_add(&self, stream: &str, payload: &[u8]) -> Result<String>;

    /// Reads up to `count` entries with an id greater than `after_id`
    /// (`"0"` to read from the start).
    async fn stream_read(
        &self,
        stream: &str,
        after_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Trims the stream so that no entries at or before `id` remain.
    async fn stream_trim_before(&self, stream: &str, id: &str) -> Result<()>;
}

/// TTL-bounded named lock, acquired over any [`KvStore`]. A crashed holder
/// self-heals once the TTL elapses.
pub struct NamedLock<'a> {
    store: &'a dyn KvStore,
    key: String,
    token: String,
}

impl<'a> NamedLock<'a> {
    /// Attempts to acquire `name` for `ttl`. Returns `None` if another
    /// holder currently owns it; callers are expected to give up silently.
    pub async fn try_acquire(
        store: &'a dyn KvStore,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<NamedLock<'a>>> {
        let key = format!("lock:{name}");
        let token = uuid::Uuid::now_v7().to_string();
        let acquired = store.set(&key, token.as_bytes(), Some(ttl), true).await?;
        if acquired {
            Ok(Some(NamedLock { store, key, token }))
        } else {
            Ok(None)
        }
    }

    /// Releases the lock, but only if it still holds the token this guard
    /// acquired (another holder may have since taken over after expiry).
    pub async fn release(self) -> Result<()> {
        self.store
            .del_if_eq(&self.key, self.token.as_bytes())
            .await?;
        Ok(())
    }
}
