use super::Config;
use crate::cache::{CacheError, CacheStore, run_blocking};
use crate::domain::{Record, RecordKey};
use crate::error::ConfigError;
use crate::sender::{HttpSender, SendError};
use crate::submitter::{SubmitterError, UploadSubmitter};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Cache error: {0}")]
    CacheError(#[from] CacheError),
    #[error("Sender error: {0}")]
    SenderError(#[from] SendError),
    #[error("Submitter error: {0}")]
    SubmitterError(#[from] SubmitterError),
    #[error("Input error: {0}")]
    InputError(#[from] std::io::Error),
    #[error("Shutdown timeout")]
    ShutdownTimeout,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Malformed input line: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// One line of input.
#[derive(Debug, Deserialize)]
struct InputLine {
    topic: String,
    value: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted: usize,
    pub dropped: usize,
}

/// Running forwarder: the cache store, the upload submitter and the record key used for
/// ingested records.
pub struct ServiceManager {
    config: Config,
    key: RecordKey,
    store: Arc<CacheStore>,
    submitter: UploadSubmitter,
}

impl ServiceManager {
    pub async fn start(config: Config) -> Result<Self, ServiceError> {
        let store = Arc::new(CacheStore::new(&config.spool_dir, config.cache_config())?);
        for topic in &config.topic_list {
            store.get_or_create(topic)?;
        }

        let sender = HttpSender::new(config.sender_config())?;
        let submitter = UploadSubmitter::spawn(
            Arc::clone(&store),
            Arc::new(sender),
            config.submitter_config(),
        )?;

        info!(
            "Forwarding {} topics from {} to {}",
            config.topic_list.len(),
            config.spool_dir.display(),
            config.endpoint
        );

        Ok(Self {
            key: config.record_key(),
            config,
            store,
            submitter,
        })
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn submitter(&self) -> &UploadSubmitter {
        &self.submitter
    }

    /// Append one `{"topic": ..., "value": ...}` document to the cache of its topic.
    pub async fn ingest_line(&self, line: &str) -> Result<(), IngestError> {
        let input: InputLine = serde_json::from_str(line)?;
        let group = self
            .store
            .get(&input.topic)
            .ok_or_else(|| CacheError::UnknownTopic(input.topic.clone()))?;
        let record = Record::new(self.key.clone(), input.value);
        run_blocking(group.active(), move |cache| cache.add(&record)).await?;
        Ok(())
    }

    /// Ingest lines until end of input or until `shutdown` is cancelled. Lines that cannot
    /// be stored are logged and dropped.
    pub async fn ingest<R>(
        &self,
        reader: R,
        shutdown: &CancellationToken,
    ) -> Result<IngestStats, ServiceError>
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut stats = IngestStats::default();
        loop {
            let line = tokio::select! {
                () = shutdown.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                info!("End of input");
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match self.ingest_line(&line).await {
                Ok(()) => stats.accepted += 1,
                Err(e) => {
                    warn!("Dropping input line: {}", e);
                    stats.dropped += 1;
                }
            }
        }
        debug!(
            "Ingested {} records, dropped {}",
            stats.accepted, stats.dropped
        );
        Ok(stats)
    }

    /// Flush pending records within the configured timeout, then stop uploading and close
    /// all caches.
    pub async fn shutdown(self) -> Result<(), ServiceError> {
        info!("Initiating graceful shutdown...");
        let flushed =
            tokio::time::timeout(self.config.shutdown_timeout, self.submitter.flush()).await;
        self.submitter.stop().await;
        self.store.close();

        match flushed {
            Ok(Ok(())) => {
                info!("Graceful shutdown completed");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                error!("Shutdown timeout exceeded");
                Err(ServiceError::ShutdownTimeout)
            }
        }
    }
}
