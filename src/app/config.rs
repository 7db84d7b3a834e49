use crate::cache::{CacheConfig, DEFAULT_MAXIMUM_CACHE_SIZE};
use crate::domain::{RecordKey, Topic};
use crate::sender::SenderConfig;
use crate::storage::MINIMUM_LENGTH;
use crate::submitter::SubmitterConfig;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Ingestion server base URL
    #[arg(long, env = "SPOOL_ENDPOINT", default_value = "http://localhost:8080")]
    pub endpoint: String,

    /// Bearer token sent with every request
    #[arg(long, env = "SPOOL_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// User the records belong to
    #[arg(long, env = "SPOOL_USER_ID", default_value = "")]
    pub user_id: String,

    /// Project the records belong to
    #[arg(long, env = "SPOOL_PROJECT_ID")]
    pub project_id: Option<String>,

    /// Source identifier attached to every record
    #[arg(long, env = "SPOOL_SOURCE_ID", default_value = "spool-forwarder")]
    pub source_id: String,

    /// Directory holding the queue files
    #[arg(long, env = "SPOOL_DIR", default_value = "/var/lib/spool-forwarder")]
    pub spool_dir: PathBuf,

    /// Topics to accept, as `name` or `name@version`
    #[arg(long = "topic", env = "SPOOL_TOPICS", value_delimiter = ',')]
    pub topics: Vec<String>,

    /// Maximum size of a single queue file in bytes
    #[arg(long, env = "MAX_CACHE_SIZE", default_value_t = DEFAULT_MAXIMUM_CACHE_SIZE)]
    pub max_cache_size: u64,

    /// Maximum number of records per upload
    #[arg(long, env = "AMOUNT_LIMIT", default_value = "1000")]
    pub amount_limit: usize,

    /// Maximum upload size in bytes
    #[arg(long, env = "SIZE_LIMIT", default_value = "5000000")]
    pub size_limit: u64,

    /// Upload interval in seconds
    #[arg(long, env = "UPLOAD_RATE_SECS", default_value = "10")]
    pub upload_rate_secs: u64,

    /// Multiplier applied to the upload interval
    #[arg(long, env = "UPLOAD_RATE_MULTIPLIER", default_value = "1")]
    pub upload_rate_multiplier: u32,

    /// Gzip request bodies
    #[arg(long, env = "ENABLE_COMPRESSION")]
    pub enable_compression: bool,

    /// Request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    /// Time allowed for the final flush in seconds
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value = "10")]
    pub shutdown_timeout_secs: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,

    /// Configuration file path (optional)
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Derived fields (not CLI arguments)
    #[serde(skip)]
    #[arg(skip)]
    pub topic_list: Vec<Topic>,

    #[serde(skip)]
    #[arg(skip)]
    pub upload_rate: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub request_timeout: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            auth_token: None,
            user_id: String::new(),
            project_id: None,
            source_id: "spool-forwarder".to_string(),
            spool_dir: PathBuf::from("/var/lib/spool-forwarder"),
            topics: Vec::new(),
            max_cache_size: DEFAULT_MAXIMUM_CACHE_SIZE,
            amount_limit: 1000,
            size_limit: 5_000_000,
            upload_rate_secs: 10,
            upload_rate_multiplier: 1,
            enable_compression: false,
            request_timeout_secs: 30,
            shutdown_timeout_secs: 10,
            log_level: LogLevel::Info,
            log_json: false,
            config_file: None,
            topic_list: Vec::new(),
            upload_rate: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::parse_from(args);
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse CLI arguments (with environment fallbacks). When a configuration file is given,
    /// it replaces the command line values.
    pub fn from_args_and_env<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let config = Config::parse_from(args);
        match &config.config_file {
            Some(path) => {
                let mut from_file = Self::from_file(path)?;
                from_file.config_file = Some(path.clone());
                Ok(from_file)
            }
            None => {
                let mut config = config;
                config.post_process()?;
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn post_process(&mut self) -> Result<(), ConfigError> {
        self.upload_rate = Duration::from_secs(self.upload_rate_secs);
        self.request_timeout = Duration::from_secs(self.request_timeout_secs);
        self.shutdown_timeout = Duration::from_secs(self.shutdown_timeout_secs);

        self.topic_list = self
            .topics
            .iter()
            .map(|topic| topic.trim())
            .filter(|topic| !topic.is_empty())
            .map(|topic| {
                topic.parse::<Topic>().map_err(|e| {
                    ConfigError::InvalidConfig(format!("Invalid topic '{topic}': {e}"))
                })
            })
            .collect::<Result<_, _>>()?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.endpoint).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid endpoint URL '{}': {}", self.endpoint, e))
        })?;

        if self.topic_list.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "At least one topic must be configured".to_string(),
            ));
        }

        let mut names: Vec<&str> = self.topic_list.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::InvalidConfig(format!(
                "Topic '{}' is configured more than once",
                pair[0]
            )));
        }

        if self.source_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "Source id must not be empty".to_string(),
            ));
        }

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_cache_size < MINIMUM_LENGTH {
            return Err(ConfigError::InvalidConfig(format!(
                "Maximum cache size must be at least {MINIMUM_LENGTH} bytes"
            )));
        }

        self.submitter_config().validate()
    }

    pub fn submitter_config(&self) -> SubmitterConfig {
        SubmitterConfig {
            user_id: self.user_id.clone(),
            project_id: self.project_id.clone(),
            amount_limit: self.amount_limit,
            size_limit: self.size_limit,
            upload_rate: self.upload_rate,
            upload_rate_multiplier: self.upload_rate_multiplier,
        }
    }

    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            endpoint: self.endpoint.clone(),
            auth_token: self.auth_token.clone(),
            timeout: self.request_timeout,
            enable_compression: self.enable_compression,
            ..SenderConfig::default()
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            maximum_size: self.max_cache_size,
        }
    }

    /// Key attached to every ingested record.
    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(self.project_id.clone(), &self.user_id, &self.source_id)
    }
}
