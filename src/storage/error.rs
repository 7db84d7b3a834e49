use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Queue is full: {needed} bytes needed, maximum is {maximum}")]
    QueueFull { needed: u64, maximum: u64 },

    #[error("Queue file is corrupt: {reason}")]
    Corrupt { reason: String },

    #[error("Queue storage is closed")]
    Closed,

    #[error("Cannot resize storage to {requested} bytes: {reason}")]
    Capacity { requested: u64, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cannot remove {requested} elements, queue holds {available}")]
    NoSuchElement { requested: usize, available: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        StorageError::Corrupt {
            reason: reason.into(),
        }
    }

    /// Whether the queue instance can still be used after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            StorageError::QueueFull { .. }
            | StorageError::Capacity { .. }
            | StorageError::InvalidArgument(_)
            | StorageError::NoSuchElement { .. } => true,
            StorageError::Corrupt { .. } | StorageError::Closed | StorageError::Io(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_queue_is_recoverable() {
        let err = StorageError::QueueFull {
            needed: 10,
            maximum: 4,
        };
        assert!(err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "Queue is full: 10 bytes needed, maximum is 4"
        );
    }

    #[test]
    fn test_corruption_is_fatal() {
        assert!(!StorageError::corrupt("bad crc").is_recoverable());
        assert!(!StorageError::Closed.is_recoverable());
    }
}
