pub mod config;
pub mod error;
pub mod group;
pub mod record_cache;
pub mod store;

pub use config::{CacheConfig, DEFAULT_MAXIMUM_CACHE_SIZE};
pub use error::{CacheError, Result};
pub use group::CacheGroup;
pub use record_cache::{Cache, run_blocking};
pub use store::CacheStore;
