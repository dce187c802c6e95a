//! Error types for kvsync.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store error: {0}")]
    Store(String),

    #[error("lock timeout")]
    LockTimeout,

    #[error("lock is not held")]
    NotHeld,

    #[error("lease lost: {0}")]
    LeaseLost(String),

    #[error("job already queued")]
    AlreadyQueued,

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// A compensating resubmit failed; the job may be lost.
    #[error("unrecoverable: could not resubmit job {job}: {reason}")]
    Unrecoverable { job: String, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for failures talking to (or reported by) the backing store.
    pub fn is_store(&self) -> bool {
        matches!(self, Error::Redis(_) | Error::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
