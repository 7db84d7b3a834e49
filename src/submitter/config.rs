use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_AMOUNT_LIMIT: usize = 1000;
pub const DEFAULT_SIZE_LIMIT: u64 = 5_000_000;
pub const DEFAULT_UPLOAD_RATE: Duration = Duration::from_secs(10);

/// Ratio between the full drain interval and the backpressure drain interval.
const BACKPRESSURE_DIVISOR: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitterConfig {
    /// Records of other users are dropped instead of uploaded.
    pub user_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    /// Maximum number of records per upload.
    pub amount_limit: usize,
    /// Maximum serialized size of an upload in bytes. A single record is always sent.
    pub size_limit: u64,
    pub upload_rate: Duration,
    pub upload_rate_multiplier: u32,
}

impl SubmitterConfig {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: None,
            amount_limit: DEFAULT_AMOUNT_LIMIT,
            size_limit: DEFAULT_SIZE_LIMIT,
            upload_rate: DEFAULT_UPLOAD_RATE,
            upload_rate_multiplier: 1,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_id.trim().is_empty() {
            return Err(ConfigError::MissingUserId);
        }
        if self.amount_limit == 0 {
            return Err(ConfigError::InvalidConfig(
                "Amount limit must be greater than 0".to_string(),
            ));
        }
        if self.size_limit == 0 {
            return Err(ConfigError::InvalidConfig(
                "Size limit must be greater than 0".to_string(),
            ));
        }
        if self.upload_rate.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "Upload rate must be greater than 0".to_string(),
            ));
        }
        if self.upload_rate_multiplier == 0 {
            return Err(ConfigError::InvalidConfig(
                "Upload rate multiplier must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Period of the full drain.
    pub fn upload_interval(&self) -> Duration {
        self.upload_rate.saturating_mul(self.upload_rate_multiplier)
    }

    /// Period of the drain of caches above the amount limit.
    pub fn backpressure_interval(&self) -> Duration {
        (self.upload_interval() / BACKPRESSURE_DIVISOR).max(Duration::from_millis(1))
    }
}
