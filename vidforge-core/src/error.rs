use thiserror::Error;

/// Crate-wide error type. One variant per external collaborator that can
/// fail: the filesystem, the catalog store, the key/value store, the probe
/// binary, the encoder child process, the instruction planner, config
/// loading, and (de)serialization.
#[derive(Error, Debug)]
pub enum VidforgeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog error: {0}")]
    Catalog(#[from] sqlx::Error),

    #[error("kv store error: {0}")]
    Kv(#[from] redis::RedisError),

    #[error("probe failed for {path}: {reason}")]
    Probe { path: String, reason: String },

    #[error("encoder failed for job {job_id}: {reason}")]
    Encoder { job_id: String, reason: String },

    #[error("planner could not build instructions: {0}")]
    Planner(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock contention: {0}")]
    LockContention(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, VidforgeError>;
