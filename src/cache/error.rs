use crate::storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache directory error at {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No cache registered for topic {0}")]
    UnknownTopic(String),

    #[error("Cache task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl CacheError {
    /// Whether the queue is full. The record can be retried after records were sent.
    pub fn is_queue_full(&self) -> bool {
        matches!(self, CacheError::Storage(StorageError::QueueFull { .. }))
    }

    /// Whether the underlying queue file can no longer be used.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            CacheError::Storage(StorageError::Corrupt { .. } | StorageError::Closed)
        )
    }
}
