//! Top-level error types for taskbeat.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("quota exceeded: tenant {tenant} already has {count} job(s) (limit {limit})")]
    QuotaExceeded {
        tenant: i64,
        count: usize,
        limit: usize,
    },

    #[error("invalid schedule: {0}")]
    ScheduleInvalid(String),

    #[error("run failed: {0}")]
    RunFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Store I/O and persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read store at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write store at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store at {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}
