pub mod config;
pub mod logging;
pub mod service;
pub mod shutdown;

pub use config::{Config, ConfigError, LogLevel};
pub use logging::{LoggingError, setup_logging};
pub use service::{IngestError, IngestStats, ServiceError, ServiceManager};
pub use shutdown::spawn_signal_handler;

use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct App {
    config: Config,
}

impl App {
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from_config(Config::from_args_and_env(args)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Forward stdin until end of input or a termination signal.
    pub async fn run(self) -> Result<(), ServiceError> {
        info!("Starting spool-forwarder v{}", env!("CARGO_PKG_VERSION"));
        info!(
            "Configuration: endpoint={}, user_id={}, topics={:?}",
            self.config.endpoint, self.config.user_id, self.config.topics
        );

        let service = ServiceManager::start(self.config).await?;
        let shutdown = CancellationToken::new();
        let signals = spawn_signal_handler(shutdown.clone());

        let ingested = service
            .ingest(BufReader::new(tokio::io::stdin()), &shutdown)
            .await;
        shutdown.cancel();
        let _ = signals.await;

        match &ingested {
            Ok(stats) => info!(
                "Input closed after {} records ({} dropped)",
                stats.accepted, stats.dropped
            ),
            Err(e) => error!("Reading input failed: {}", e),
        }
        service.shutdown().await?;
        ingested.map(|_| ())
    }
}

pub async fn main() -> anyhow::Result<()> {
    let app = App::from_args(std::env::args_os())?;

    if let Err(e) = setup_logging(app.config().log_level, app.config().log_json) {
        eprintln!("Warning: {}", e);
    }

    app.run().await?;
    Ok(())
}
