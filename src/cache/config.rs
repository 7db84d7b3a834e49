use serde::{Deserialize, Serialize};

/// Default upper bound for a single queue file.
pub const DEFAULT_MAXIMUM_CACHE_SIZE: u64 = 450_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum size of each queue file in bytes. Rounded down to a power-of-two multiple of
    /// the file system block size.
    pub maximum_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            maximum_size: DEFAULT_MAXIMUM_CACHE_SIZE,
        }
    }
}
