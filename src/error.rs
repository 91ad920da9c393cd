//! Error taxonomy shared by the storage, remote and indexing layers.

use std::time::Duration;
use thiserror::Error;

/// Boxed error produced by a [`crate::source::MessageSource`].
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("blocking database task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} answered {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("rate limited by {url}; gave up after {attempts} attempts")]
    RetriesExhausted { url: String, attempts: u32 },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// HTTP status of the failed call, when the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Status { status, .. } => Some(*status),
            RemoteError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Server-requested delay from a `Retry-After` header.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("channel {channel} does not belong to guild {guild}")]
    Validation { channel: u64, guild: u64 },
    #[error("channel {0} is not indexed")]
    NotFound(u64),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("message history unavailable: {0}")]
    Source(#[source] SourceError),
    #[error("embedding workers are shut down")]
    WorkersClosed,
    #[error("sync cycle failed for {failed} of {total} channels")]
    CycleFailed { failed: usize, total: usize },
}

impl From<rusqlite::Error> for IndexError {
    fn from(e: rusqlite::Error) -> Self {
        IndexError::Storage(StoreError::Sqlite(e))
    }
}
