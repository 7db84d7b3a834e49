pub mod http;

pub use http::{HttpSender, HttpTopicSender, SenderConfig};

use crate::domain::{RecordBatch, Topic};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SendError {
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Not connected: {0}")]
    NotConnected(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SendError {
    /// Whether the server rejected the credentials. Records are kept and the user has to
    /// log in again.
    pub fn is_authentication(&self) -> bool {
        matches!(self, SendError::Authentication(_))
    }
}

/// Connection to the ingestion server.
#[async_trait]
pub trait UploadSender: Send + Sync {
    /// Last known connection state.
    fn is_connected(&self) -> bool;

    /// Re-establish the connection and report whether the server can be reached.
    async fn reset_connection(&self) -> Result<bool, SendError>;

    /// Create a sender for a single topic.
    fn topic_sender(&self, topic: &Topic) -> Result<Box<dyn TopicSender>, SendError>;

    fn close(&self) {}
}

/// Sends batches of one topic.
#[async_trait]
pub trait TopicSender: Send + Sync {
    async fn send(&self, batch: &RecordBatch) -> Result<(), SendError>;

    fn close(&self) {}
}
