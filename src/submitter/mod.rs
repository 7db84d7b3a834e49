//! Periodic upload of cached records.
//!
//! An [`UploadSubmitter`] owns a single actor task. The task runs the full drain and the
//! backpressure drain on two intervals and handles flush, configuration and stop commands in
//! between, so no two drains ever overlap.

pub mod config;
pub mod receipt;

pub use config::SubmitterConfig;
pub use receipt::{SendOutcome, TopicSendResult};

use crate::cache::{Cache, CacheError, CacheGroup, CacheStore, run_blocking};
use crate::connection::{
    ConnectionChecker, ConnectionCheckerConfig, HEARTBEAT_RATE_MULTIPLIER, ServerStatus,
};
use crate::domain::Topic;
use crate::error::ConfigError;
use crate::sender::{SendError, TopicSender, UploadSender};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RECEIPT_CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum SubmitterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Submitter is stopped")]
    Stopped,
}

#[derive(Error, Debug)]
enum UploadError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Send(#[from] SendError),
}

enum Command {
    Flush(oneshot::Sender<()>),
    Configure(Box<SubmitterConfig>),
    CheckConnection(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

/// Drains the caches of a [`CacheStore`] through an [`UploadSender`].
#[derive(Debug)]
pub struct UploadSubmitter {
    commands: mpsc::UnboundedSender<Command>,
    receipts: broadcast::Sender<TopicSendResult>,
    checker: ConnectionChecker,
    cancel: CancellationToken,
}

impl UploadSubmitter {
    /// Start the actor task. Must be called inside a Tokio runtime.
    pub fn spawn(
        store: Arc<CacheStore>,
        sender: Arc<dyn UploadSender>,
        config: SubmitterConfig,
    ) -> Result<Self, SubmitterError> {
        config.validate()?;

        let checker = ConnectionChecker::new(
            Arc::clone(&sender),
            ConnectionCheckerConfig::from_upload_rate(config.upload_rate),
        );
        checker.initialize(sender.is_connected());

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (receipts, _) = broadcast::channel(RECEIPT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let actor = SubmitterActor {
            store,
            sender,
            checker: checker.clone(),
            config,
            topic_senders: HashMap::new(),
            receipts: receipts.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run(command_rx));

        Ok(Self {
            commands,
            receipts,
            checker,
            cancel,
        })
    }

    /// Replace the configuration and restart both drain intervals.
    pub fn set_config(&self, config: SubmitterConfig) -> Result<(), SubmitterError> {
        config.validate()?;
        self.commands
            .send(Command::Configure(Box::new(config)))
            .map_err(|_| SubmitterError::Stopped)
    }

    /// Run one full drain and wait for it to finish.
    pub async fn flush(&self) -> Result<(), SubmitterError> {
        self.request(Command::Flush).await
    }

    /// Check the connection to the server now.
    pub async fn check_connection(&self) -> Result<(), SubmitterError> {
        self.request(Command::CheckConnection).await
    }

    /// Stop the drain loops without flushing and close the topic senders. A drain in
    /// progress is abandoned after the current cache operation; unsent records stay cached.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if self.request(Command::Stop).await.is_err() {
            debug!("Submitter already stopped");
        }
        self.checker.stop();
    }

    pub fn subscribe_receipts(&self) -> broadcast::Receiver<TopicSendResult> {
        self.receipts.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ServerStatus> {
        self.checker.subscribe_status()
    }

    pub fn status(&self) -> ServerStatus {
        self.checker.status()
    }

    pub fn checker(&self) -> &ConnectionChecker {
        &self.checker
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<()>) -> Command,
    ) -> Result<(), SubmitterError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(command(done_tx))
            .map_err(|_| SubmitterError::Stopped)?;
        done_rx.await.map_err(|_| SubmitterError::Stopped)
    }
}

/// Progress of one drain round.
#[derive(Debug, Default)]
struct DrainRound {
    uploading: bool,
    sent: usize,
}

struct SubmitterActor {
    store: Arc<CacheStore>,
    sender: Arc<dyn UploadSender>,
    checker: ConnectionChecker,
    config: SubmitterConfig,
    topic_senders: HashMap<Topic, Box<dyn TopicSender>>,
    receipts: broadcast::Sender<TopicSendResult>,
    cancel: CancellationToken,
}

impl SubmitterActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(
            "Upload submitter started for user {} (every {:?})",
            self.config.user_id,
            self.config.upload_interval()
        );
        if !self.checker.is_connected() {
            tokio::select! {
                () = self.checker.check() => {}
                () = self.cancel.cancelled() => {}
            }
        }

        let mut full_drain = drain_interval(self.config.upload_interval());
        let mut backpressure = drain_interval(self.config.backpressure_interval());

        loop {
            tokio::select! {
                _ = full_drain.tick() => self.drain_all().await,
                _ = backpressure.tick() => self.drain_backpressure().await,
                command = commands.recv() => match command {
                    Some(Command::Flush(done)) => {
                        self.drain_all().await;
                        let _ = done.send(());
                    }
                    Some(Command::Configure(config)) => {
                        self.configure(*config);
                        full_drain = drain_interval(self.config.upload_interval());
                        backpressure = drain_interval(self.config.backpressure_interval());
                    }
                    Some(Command::CheckConnection(done)) => {
                        self.checker.check().await;
                        let _ = done.send(());
                    }
                    Some(Command::Stop(done)) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
            }
        }
    }

    fn configure(&mut self, config: SubmitterConfig) {
        info!(
            "Submitter configuration changed: user {}, every {:?}",
            config.user_id,
            config.upload_interval()
        );
        let mut checker_config = self.checker.config();
        checker_config.heartbeat_interval = config.upload_rate * HEARTBEAT_RATE_MULTIPLIER;
        self.checker.set_config(checker_config);
        self.config = config;
    }

    fn shutdown(&mut self) {
        self.checker.stop();
        for (_, sender) in self.topic_senders.drain() {
            sender.close();
        }
        info!("Upload submitter stopped");
    }

    /// Whether uploads may continue: connected and not stopping.
    fn can_upload(&self) -> bool {
        self.checker.is_connected() && !self.cancel.is_cancelled()
    }

    /// Drain every topic until it runs out of full batches or the connection drops.
    async fn drain_all(&mut self) {
        let mut round = DrainRound::default();
        let mut groups = self.store.groups();
        while self.can_upload() && !groups.is_empty() {
            let mut remaining = Vec::new();
            for group in groups {
                if !self.can_upload() {
                    break;
                }
                if self.drain_group(&group, &mut round).await >= self.config.amount_limit {
                    remaining.push(group);
                }
            }
            groups = remaining;
        }
        self.finish_round(&round);
    }

    /// Drain active caches holding more than one batch until none do.
    async fn drain_backpressure(&mut self) {
        let mut round = DrainRound::default();
        let mut skipped = HashSet::new();
        while self.can_upload() {
            let full: Vec<Arc<CacheGroup>> = self
                .store
                .groups()
                .into_iter()
                .filter(|group| !skipped.contains(group.topic_name()))
                .filter(|group| group.active().unsent_count() > self.config.amount_limit)
                .collect();
            if full.is_empty() {
                break;
            }
            for group in full {
                if !self.can_upload() {
                    break;
                }
                debug!(
                    "Topic {} holds {} records, draining",
                    group.topic_name(),
                    group.active().unsent_count()
                );
                if self.drain_cache(group.active(), &mut round).await == 0 {
                    skipped.insert(group.topic_name().to_string());
                }
            }
        }
        self.finish_round(&round);
    }

    /// Drain one batch from each cache of the group. Returns the largest batch size.
    async fn drain_group(&mut self, group: &Arc<CacheGroup>, round: &mut DrainRound) -> usize {
        let mut largest = 0;
        for cache in group.caches() {
            if !self.can_upload() {
                break;
            }
            largest = largest.max(self.drain_cache(&cache, round).await);
        }
        let group = Arc::clone(group);
        if let Err(e) = tokio::task::spawn_blocking(move || group.delete_empty_caches()).await {
            error!("Cannot delete empty caches: {}", e);
        }
        largest
    }

    /// Upload one batch of the cache. Errors are absorbed here and reported as zero records.
    async fn drain_cache(&mut self, cache: &Arc<Cache>, round: &mut DrainRound) -> usize {
        match self.upload_cache(cache, round).await {
            Ok(count) => count,
            Err(UploadError::Send(e)) => {
                self.checker.did_disconnect(Some(&e));
                0
            }
            Err(UploadError::Cache(e)) => {
                error!("Cannot read cache for topic {}: {}", cache.topic(), e);
                if e.is_corrupt() {
                    let config = self.store.config();
                    if let Err(e) = run_blocking(cache, move |cache| cache.reset(&config)).await {
                        error!("Cannot reset cache for topic {}: {}", cache.topic(), e);
                    }
                }
                0
            }
        }
    }

    async fn upload_cache(
        &mut self,
        cache: &Arc<Cache>,
        round: &mut DrainRound,
    ) -> Result<usize, UploadError> {
        let (amount_limit, size_limit) = (self.config.amount_limit, self.config.size_limit);
        let batch = run_blocking(cache, move |cache| {
            cache.unsent_records(amount_limit, size_limit)
        })
        .await?;
        let Some(batch) = batch else {
            return Ok(0);
        };
        let count = batch.len();

        if !batch
            .key
            .belongs_to(&self.config.user_id, self.config.project_id.as_deref())
        {
            warn!(
                "Dropping {} records of topic {} from {}, current user is {}",
                count, batch.topic, batch.key, self.config.user_id
            );
            run_blocking(cache, move |cache| cache.remove(count)).await?;
            return Ok(count);
        }

        if !round.uploading {
            round.uploading = true;
            self.checker.set_status(ServerStatus::Uploading);
        }

        let cancel = self.cancel.clone();
        let result = match self.topic_sender(&batch.topic) {
            Ok(sender) => tokio::select! {
                result = sender.send(&batch) => result,
                () = cancel.cancelled() => {
                    debug!("Upload of topic {} cancelled, keeping {} records", batch.topic, count);
                    return Ok(0);
                }
            },
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                run_blocking(cache, move |cache| cache.remove(count)).await?;
                round.sent += count;
                self.publish(TopicSendResult::success(batch.topic.clone(), count));
                Ok(count)
            }
            Err(e) => {
                if e.is_authentication() {
                    warn!("Upload of topic {} was not authorized: {}", batch.topic, e);
                } else {
                    warn!("Upload of topic {} failed: {}", batch.topic, e);
                    self.checker.set_status(ServerStatus::UploadingFailed);
                }
                self.publish(TopicSendResult::failure(batch.topic.clone()));
                Err(e.into())
            }
        }
    }

    fn topic_sender(&mut self, topic: &Topic) -> Result<&dyn TopicSender, SendError> {
        if !self.topic_senders.contains_key(topic) {
            let sender = self.sender.topic_sender(topic)?;
            self.topic_senders.insert(topic.clone(), sender);
        }
        self.topic_senders
            .get(topic)
            .map(|sender| sender.as_ref())
            .ok_or_else(|| SendError::NotConnected(format!("No sender for topic {}", topic)))
    }

    fn finish_round(&self, round: &DrainRound) {
        if round.sent > 0 {
            debug!("Uploaded {} records", round.sent);
            self.checker.set_status(ServerStatus::Connected);
            self.checker.did_connect();
        }
    }

    fn publish(&self, receipt: TopicSendResult) {
        // no subscribers is fine
        let _ = self.receipts.send(receipt);
    }
}

fn drain_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
