use super::record_cache::Cache;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

/// The active cache of a topic together with caches left over from other topic versions.
///
/// New records only go to the active cache. Deprecated caches are drained and deleted once
/// empty.
#[derive(Debug)]
pub struct CacheGroup {
    active: Arc<Cache>,
    deprecated: Mutex<Vec<Arc<Cache>>>,
}

impl CacheGroup {
    pub fn new(active: Arc<Cache>, deprecated: Vec<Arc<Cache>>) -> Self {
        Self {
            active,
            deprecated: Mutex::new(deprecated),
        }
    }

    pub fn topic_name(&self) -> &str {
        &self.active.topic().name
    }

    pub fn active(&self) -> &Arc<Cache> {
        &self.active
    }

    pub fn deprecated(&self) -> Vec<Arc<Cache>> {
        self.deprecated.lock().clone()
    }

    /// All caches, deprecated ones first so older data is sent before newer data.
    pub fn caches(&self) -> Vec<Arc<Cache>> {
        let mut caches = self.deprecated();
        caches.push(Arc::clone(&self.active));
        caches
    }

    /// Close and delete deprecated caches that hold no more records.
    pub fn delete_empty_caches(&self) {
        let mut deprecated = self.deprecated.lock();
        deprecated.retain(|cache| {
            if cache.unsent_count() > 0 {
                return true;
            }
            if let Err(e) = cache.close() {
                warn!("Failed to close deprecated cache {}: {}", cache.topic(), e);
            }
            match std::fs::remove_file(cache.path()) {
                Ok(()) => info!("Removed empty deprecated cache {}", cache.path().display()),
                Err(e) => warn!(
                    "Cannot remove old cache file {}: {}",
                    cache.path().display(),
                    e
                ),
            }
            false
        });
    }

    pub fn close(&self) {
        for cache in self.caches() {
            if let Err(e) = cache.close() {
                warn!("Failed to close cache {}: {}", cache.topic(), e);
            }
        }
    }
}
