//! Error types for checkpoint persistence and replication.

use thiserror::Error;

/// Checkpoint subsystem error type.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Invalid configuration or unsupported values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A stored row could not be decoded.
    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),
    /// `SQLite` storage error (sync).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// `SQLite` storage error (async).
    #[error("tokio-rusqlite error: {0}")]
    TokioSqlite(#[from] tokio_rusqlite::Error),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// HTTP transport error while talking to the remote replica.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// URL parse error.
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    /// The remote replica rejected a request.
    #[error("remote replica error: {0}")]
    Remote(String),
    /// The checkpointer was already closed.
    #[error("checkpointer is closed")]
    Closed,
}

impl CheckpointError {
    /// Whether the error means the local connection is gone.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::TokioSqlite(tokio_rusqlite::Error::ConnectionClosed)
        )
    }
}

/// Convenience result alias for checkpoint operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;
