use super::config::CacheConfig;
use super::error::{CacheError, Result};
use super::group::CacheGroup;
use super::record_cache::{Cache, quarantine};
use crate::domain::Topic;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Registry of cache groups stored in one directory, keyed by topic name.
pub struct CacheStore {
    directory: PathBuf,
    config: RwLock<CacheConfig>,
    groups: RwLock<HashMap<String, Arc<CacheGroup>>>,
}

impl CacheStore {
    pub fn new(directory: impl Into<PathBuf>, config: CacheConfig) -> Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory).map_err(|source| CacheError::Directory {
            path: directory.display().to_string(),
            source,
        })?;
        Ok(Self {
            directory,
            config: RwLock::new(config),
            groups: RwLock::new(HashMap::new()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Return the group of `topic`, opening its files on first use.
    ///
    /// Existing files for the same topic name with a different version become deprecated
    /// caches of the group.
    pub fn get_or_create(&self, topic: &Topic) -> Result<Arc<CacheGroup>> {
        if let Some(group) = self.groups.read().get(&topic.name) {
            return Ok(Arc::clone(group));
        }

        let mut groups = self.groups.write();
        if let Some(group) = groups.get(&topic.name) {
            return Ok(Arc::clone(group));
        }

        let group = Arc::new(self.load_group(topic)?);
        groups.insert(topic.name.clone(), Arc::clone(&group));
        Ok(group)
    }

    pub fn get(&self, topic_name: &str) -> Option<Arc<CacheGroup>> {
        self.groups.read().get(topic_name).cloned()
    }

    /// All registered groups, ordered by topic name.
    pub fn groups(&self) -> Vec<Arc<CacheGroup>> {
        let mut groups: Vec<_> = self.groups.read().values().cloned().collect();
        groups.sort_by(|a, b| a.topic_name().cmp(b.topic_name()));
        groups
    }

    /// Unregister and close the group of a topic.
    pub fn remove(&self, topic_name: &str) -> Option<Arc<CacheGroup>> {
        let group = self.groups.write().remove(topic_name)?;
        group.close();
        Some(group)
    }

    pub fn config(&self) -> CacheConfig {
        self.config.read().clone()
    }

    /// Apply a new configuration to all open caches.
    pub fn set_config(&self, config: CacheConfig) -> Result<()> {
        for group in self.groups() {
            for cache in group.caches() {
                cache.set_config(&config)?;
            }
        }
        *self.config.write() = config;
        Ok(())
    }

    pub fn close(&self) {
        let groups: Vec<_> = self.groups.write().drain().map(|(_, group)| group).collect();
        for group in groups {
            group.close();
        }
    }

    fn load_group(&self, topic: &Topic) -> Result<CacheGroup> {
        let config = self.config();
        let mut deprecated = Vec::new();

        for existing in self.existing_topics(&topic.name)? {
            if existing.version == topic.version {
                continue;
            }
            let path = self.directory.join(existing.file_name());
            match Cache::open(&path, existing.clone(), &config) {
                Ok(cache) => {
                    debug!("Loading deprecated cache {}", path.display());
                    deprecated.push(Arc::new(cache));
                }
                Err(e) if e.is_corrupt() => {
                    error!("Ignoring corrupt deprecated cache {}: {}", path.display(), e);
                    quarantine(&path);
                }
                Err(e) => return Err(e),
            }
        }

        let path = self.directory.join(topic.file_name());
        let active = match Cache::open(&path, topic.clone(), &config) {
            Ok(cache) => cache,
            Err(e) if e.is_corrupt() => {
                error!("Cache {} is corrupt, starting a new one: {}", path.display(), e);
                quarantine(&path);
                Cache::open(&path, topic.clone(), &config)?
            }
            Err(e) => return Err(e),
        };
        info!(
            "Opened cache for topic {} ({} unsent, {} deprecated caches)",
            topic,
            active.unsent_count(),
            deprecated.len()
        );

        Ok(CacheGroup::new(Arc::new(active), deprecated))
    }

    /// Topics with a queue file in the store directory that share `name`.
    fn existing_topics(&self, name: &str) -> Result<Vec<Topic>> {
        let entries = std::fs::read_dir(&self.directory).map_err(|source| CacheError::Directory {
            path: self.directory.display().to_string(),
            source,
        })?;

        let mut topics: Vec<Topic> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
            .filter_map(|entry| Topic::from_file_name(&entry.file_name().to_string_lossy()))
            .filter(|topic| topic.name == name)
            .collect();
        topics.sort();
        Ok(topics)
    }
}
