//! Connection state tracking for the upload pipeline.
//!
//! [`ConnectionChecker`] keeps one scheduled task at a time: a heartbeat while the server is
//! reachable, or a single delayed retry while it is not. Every state transition cancels the
//! previous task before scheduling the next one.

pub mod backoff;
pub mod status;

pub use backoff::{Backoff, BackoffConfig};
pub use status::ServerStatus;

use crate::sender::{SendError, UploadSender};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Heartbeat interval as a multiple of the upload rate.
pub const HEARTBEAT_RATE_MULTIPLIER: u32 = 5;
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCheckerConfig {
    pub heartbeat_interval: Duration,
    /// Time since the last confirmed contact after which a heartbeat resets the connection.
    pub stale_threshold: Duration,
    pub backoff: BackoffConfig,
}

impl ConnectionCheckerConfig {
    pub fn from_upload_rate(upload_rate: Duration) -> Self {
        Self {
            heartbeat_interval: upload_rate * HEARTBEAT_RATE_MULTIPLIER,
            ..Self::default()
        }
    }
}

impl Default for ConnectionCheckerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10) * HEARTBEAT_RATE_MULTIPLIER,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
            backoff: BackoffConfig::default(),
        }
    }
}

struct CheckerState {
    connected: bool,
    backoff: Backoff,
    last_contact: Option<Instant>,
    task: Option<JoinHandle<()>>,
    generation: u64,
}

impl CheckerState {
    fn cancel_task(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Inner {
    sender: Arc<dyn UploadSender>,
    config: Mutex<ConnectionCheckerConfig>,
    state: Mutex<CheckerState>,
    status: watch::Sender<ServerStatus>,
}

/// Tracks whether the server is reachable and schedules heartbeats and retries.
///
/// Scheduling uses `tokio::spawn`, so transitions must happen inside a Tokio runtime.
#[derive(Clone)]
pub struct ConnectionChecker {
    inner: Arc<Inner>,
}

impl ConnectionChecker {
    pub fn new(sender: Arc<dyn UploadSender>, config: ConnectionCheckerConfig) -> Self {
        let (status, _) = watch::channel(ServerStatus::Connecting);
        let backoff = Backoff::new(config.backoff.clone());
        Self {
            inner: Arc::new(Inner {
                sender,
                config: Mutex::new(config),
                state: Mutex::new(CheckerState {
                    connected: false,
                    backoff,
                    last_contact: None,
                    task: None,
                    generation: 0,
                }),
                status,
            }),
        }
    }

    /// Set the initial state and schedule the first heartbeat or retry.
    pub fn initialize(&self, connected: bool) {
        let mut state = self.inner.state.lock();
        state.cancel_task();
        state.backoff.reset();
        if connected {
            state.connected = true;
            state.last_contact = Some(Instant::now());
            self.schedule_heartbeat(&mut state);
            self.publish(ServerStatus::Connected);
        } else {
            state.connected = false;
            self.schedule_retry(&mut state);
            self.publish(ServerStatus::Disconnected);
        }
    }

    /// Record a successful contact with the server.
    pub fn did_connect(&self) {
        let mut state = self.inner.state.lock();
        state.last_contact = Some(Instant::now());
        if state.connected {
            return;
        }
        info!("Connected to server");
        state.connected = true;
        state.backoff.reset();
        state.cancel_task();
        self.schedule_heartbeat(&mut state);
        self.publish(ServerStatus::Connected);
    }

    /// Record a failed contact. While a retry is already pending the schedule is kept.
    pub fn did_disconnect(&self, error: Option<&SendError>) {
        let mut state = self.inner.state.lock();
        let status = disconnected_status(error);
        if !state.connected && state.task.is_some() {
            self.publish(status);
            return;
        }
        match error {
            Some(e) => warn!("Disconnected from server: {}", e),
            None => info!("Disconnected from server"),
        }
        state.connected = false;
        state.cancel_task();
        self.schedule_retry(&mut state);
        self.publish(status);
    }

    /// Reset the connection now and transition according to the result.
    pub async fn check(&self) {
        match self.inner.sender.reset_connection().await {
            Ok(true) => self.did_connect(),
            Ok(false) => self.did_disconnect(None),
            Err(e) => self.did_disconnect(Some(&e)),
        }
    }

    /// Cancel any scheduled heartbeat or retry.
    pub fn stop(&self) {
        self.inner.state.lock().cancel_task();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    pub fn status(&self) -> ServerStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ServerStatus> {
        self.inner.status.subscribe()
    }

    /// Publish an upload progress status.
    pub fn set_status(&self, status: ServerStatus) {
        self.publish(status);
    }

    pub fn config(&self) -> ConnectionCheckerConfig {
        self.inner.config.lock().clone()
    }

    /// Replace the configuration. A running heartbeat is rescheduled with the new interval.
    pub fn set_config(&self, config: ConnectionCheckerConfig) {
        let mut state = self.inner.state.lock();
        if state.backoff.config() != &config.backoff {
            state.backoff = Backoff::new(config.backoff.clone());
        }
        *self.inner.config.lock() = config;
        if state.connected && state.task.is_some() {
            state.cancel_task();
            self.schedule_heartbeat(&mut state);
        }
    }

    fn publish(&self, status: ServerStatus) {
        let previous = self.inner.status.send_replace(status);
        if previous != status {
            debug!("Server status changed from {} to {}", previous, status);
        }
    }

    fn schedule_heartbeat(&self, state: &mut CheckerState) {
        let interval = self.inner.config.lock().heartbeat_interval;
        let generation = state.generation;
        let weak = Arc::downgrade(&self.inner);
        state.task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(checker) = upgrade_current(&weak, generation, false) else {
                    return;
                };
                checker.heartbeat().await;
            }
        }));
    }

    fn schedule_retry(&self, state: &mut CheckerState) {
        let delay = state.backoff.next_delay();
        debug!(
            "Retrying connection in {:?} (attempt {})",
            delay,
            state.backoff.attempt()
        );
        let generation = state.generation;
        let weak = Arc::downgrade(&self.inner);
        state.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(checker) = upgrade_current(&weak, generation, true) else {
                return;
            };
            checker.check().await;
        }));
    }

    async fn heartbeat(&self) {
        let stale = {
            let threshold = self.inner.config.lock().stale_threshold;
            self.inner
                .state
                .lock()
                .last_contact
                .is_none_or(|contact| contact.elapsed() > threshold)
        };
        if !self.inner.sender.is_connected() || stale {
            debug!("Heartbeat resets connection");
            self.check().await;
        }
    }
}

impl std::fmt::Debug for ConnectionChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionChecker")
            .field("connected", &self.is_connected())
            .field("status", &self.status())
            .finish()
    }
}

/// Returns the checker if the calling task is still the scheduled one. With `release` the
/// task handle is dropped so the next transition schedules a new task.
fn upgrade_current(
    weak: &Weak<Inner>,
    generation: u64,
    release: bool,
) -> Option<ConnectionChecker> {
    let inner = weak.upgrade()?;
    {
        let mut state = inner.state.lock();
        if state.generation != generation {
            return None;
        }
        if release {
            state.task = None;
        }
    }
    Some(ConnectionChecker { inner })
}

fn disconnected_status(error: Option<&SendError>) -> ServerStatus {
    match error {
        Some(e) if e.is_authentication() => ServerStatus::Unauthorized,
        _ => ServerStatus::Disconnected,
    }
}
