use super::config::CacheConfig;
use super::error::Result;
use crate::domain::{Record, RecordBatch, Topic};
use crate::queue::ElementQueue;
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Persistent record queue of a single topic.
///
/// Records are stored as JSON documents, one per queue element. All queue access goes through
/// an internal lock so producers and the uploader can share the cache.
pub struct Cache {
    topic: Topic,
    path: PathBuf,
    queue: Mutex<ElementQueue>,
}

impl Cache {
    pub fn open(path: impl Into<PathBuf>, topic: Topic, config: &CacheConfig) -> Result<Self> {
        let path = path.into();
        let queue = ElementQueue::open(&path, config.maximum_size)?;
        debug!("Opened cache {} with {} records", path.display(), queue.len());
        Ok(Self {
            topic,
            path,
            queue: Mutex::new(queue),
        })
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add(&self, record: &Record) -> Result<()> {
        self.add_all(std::slice::from_ref(record)).map(|_| ())
    }

    /// Append records in order. Every record is serialized before anything is written. When
    /// the queue fills up, records written before the failing one are kept.
    pub fn add_all(&self, records: &[Record]) -> Result<usize> {
        let encoded = records
            .iter()
            .map(serde_json::to_vec)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut queue = self.queue.lock();
        let mut writer = queue.element_writer()?;
        for data in &encoded {
            writer.append(data)?;
            writer.next()?;
        }
        Ok(writer.finish()?)
    }

    /// Number of records not yet removed.
    pub fn unsent_count(&self) -> usize {
        self.queue.lock().len()
    }

    /// Read the next batch of records without removing them.
    ///
    /// At most `max_count` records are read, and after the first record no more than
    /// `max_bytes` serialized bytes. Leading records that cannot be decoded are removed. The
    /// batch holds the run of records that share the key of the first valid record.
    pub fn unsent_records(&self, max_count: usize, max_bytes: u64) -> Result<Option<RecordBatch>> {
        if max_count == 0 {
            return Ok(None);
        }
        let mut queue = self.queue.lock();
        loop {
            let records = read_head(&queue, max_count, max_bytes)?;
            if records.is_empty() {
                return Ok(None);
            }

            let invalid = records.iter().take_while(|r| r.is_none()).count();
            if invalid > 0 {
                warn!(
                    "Removing {} undecodable records from cache {}",
                    invalid, self.topic
                );
                queue.remove(invalid)?;
                if invalid == records.len() {
                    continue;
                }
            }

            let mut valid = records.into_iter().skip(invalid).map_while(|r| r);
            let Some(first) = valid.next() else {
                return Ok(None);
            };
            let key = first.key;
            let values = std::iter::once(first.value)
                .chain(valid.map_while(|r| (r.key == key).then_some(r.value)))
                .collect();
            return Ok(Some(RecordBatch::new(self.topic.clone(), key, values)));
        }
    }

    /// Remove up to `n` of the eldest records. Returns the number removed.
    pub fn remove(&self, n: usize) -> Result<usize> {
        let mut queue = self.queue.lock();
        let actual = n.min(queue.len());
        if actual > 0 {
            debug!("Removing {} records from topic {}", actual, self.topic);
            queue.remove(actual)?;
        }
        Ok(actual)
    }

    /// Remove all records and shrink the file.
    pub fn clear(&self) -> Result<()> {
        Ok(self.queue.lock().clear()?)
    }

    pub fn set_config(&self, config: &CacheConfig) -> Result<()> {
        Ok(self.queue.lock().set_maximum_file_size(config.maximum_size)?)
    }

    pub fn file_size(&self) -> u64 {
        self.queue.lock().file_size()
    }

    /// Replace an unusable queue file with an empty one. The old file is kept next to the new
    /// one with a `.corrupt` suffix.
    pub fn reset(&self, config: &CacheConfig) -> Result<()> {
        let mut queue = self.queue.lock();
        let _ = queue.close();
        quarantine(&self.path);
        *queue = ElementQueue::open(&self.path, config.maximum_size)?;
        info!("Reset cache for topic {}", self.topic);
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        Ok(self.queue.lock().close()?)
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("topic", &self.topic)
            .field("path", &self.path)
            .finish()
    }
}

/// Run a cache operation on the blocking thread pool. Queue files are synced on every
/// write, which must not stall the async workers.
pub async fn run_blocking<T, F>(cache: &Arc<Cache>, operation: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Cache) -> Result<T> + Send + 'static,
{
    let cache = Arc::clone(cache);
    tokio::task::spawn_blocking(move || operation(&cache)).await?
}

/// Decode records from the head of the queue. Undecodable records are returned as `None`.
fn read_head(
    queue: &ElementQueue,
    max_count: usize,
    max_bytes: u64,
) -> Result<Vec<Option<Record>>> {
    let mut records = Vec::new();
    let mut total_bytes = 0u64;
    for reader in queue.iter().take(max_count) {
        let reader = reader?;
        total_bytes += reader.len();
        if !records.is_empty() && total_bytes > max_bytes {
            break;
        }
        let data = reader.read_all()?;
        match serde_json::from_slice::<Record>(&data) {
            Ok(record) => records.push(Some(record)),
            Err(e) => {
                debug!("Cannot decode record: {}", e);
                records.push(None);
            }
        }
    }
    Ok(records)
}

fn quarantine_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}

/// Move an unusable queue file out of the way, or delete it if that fails.
pub(crate) fn quarantine(path: &Path) {
    let target = quarantine_path(path);
    match std::fs::rename(path, &target) {
        Ok(()) => warn!("Moved corrupt cache {} to {}", path.display(), target.display()),
        Err(e) => {
            warn!("Cannot move corrupt cache {}: {}", path.display(), e);
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RecordKey;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    fn record(user: &str, i: i64) -> Record {
        Record::new(RecordKey::new(None, user, "source"), json!({ "i": i }))
    }

    fn open(dir: &TempDir) -> Cache {
        Cache::open(
            dir.path().join("test-v1.tape"),
            Topic::new("test", 1),
            &CacheConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_batch_stops_at_key_change() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        cache
            .add_all(&[record("a", 1), record("a", 2), record("b", 3), record("a", 4)])
            .unwrap();

        let batch = cache.unsent_records(10, u64::MAX).unwrap().unwrap();
        assert_eq!(batch.key.user_id, "a");
        assert_eq!(batch.values, vec![json!({"i": 1}), json!({"i": 2})]);
        assert_eq!(cache.unsent_count(), 4);
    }

    #[test]
    fn test_batch_respects_limits() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        let records: Vec<Record> = (0..10).map(|i| record("a", i)).collect();
        cache.add_all(&records).unwrap();

        assert_eq!(cache.unsent_records(3, u64::MAX).unwrap().unwrap().len(), 3);
        // always at least one record
        assert_eq!(cache.unsent_records(10, 1).unwrap().unwrap().len(), 1);
        let one = serde_json::to_vec(&records[0]).unwrap().len() as u64;
        assert_eq!(cache.unsent_records(10, 2 * one).unwrap().unwrap().len(), 2);
        assert!(cache.unsent_records(0, u64::MAX).unwrap().is_none());
    }

    #[test]
    fn test_leading_invalid_records_are_removed() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        {
            let mut queue = cache.queue.lock();
            let mut writer = queue.element_writer().unwrap();
            writer.write_all(b"not json").unwrap();
            writer.next().unwrap();
            writer.write_all(b"{}").unwrap();
            writer.finish().unwrap();
        }
        cache.add(&record("a", 1)).unwrap();
        assert_eq!(cache.unsent_count(), 3);

        let batch = cache.unsent_records(10, u64::MAX).unwrap().unwrap();
        assert_eq!(batch.values, vec![json!({"i": 1})]);
        assert_eq!(cache.unsent_count(), 1);
    }

    #[test]
    fn test_only_invalid_records() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        {
            let mut queue = cache.queue.lock();
            let mut writer = queue.element_writer().unwrap();
            writer.write_all(b"garbage").unwrap();
            writer.finish().unwrap();
        }
        assert!(cache.unsent_records(10, u64::MAX).unwrap().is_none());
        assert_eq!(cache.unsent_count(), 0);
    }

    #[test]
    fn test_remove_is_clamped() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        cache.add_all(&[record("a", 1), record("a", 2)]).unwrap();
        assert_eq!(cache.remove(5).unwrap(), 2);
        assert_eq!(cache.unsent_count(), 0);
        assert_eq!(cache.remove(1).unwrap(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_run_blocking_keeps_runtime_responsive() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(open(&dir));

        let slow = run_blocking(&cache, |cache| {
            std::thread::sleep(std::time::Duration::from_millis(200));
            cache.add(&record("a", 1))
        });
        let tick = async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            std::time::Instant::now()
        };
        let started = std::time::Instant::now();
        let (added, ticked) = tokio::join!(slow, tick);

        added.unwrap();
        assert!(ticked - started < std::time::Duration::from_millis(150));
        assert_eq!(cache.unsent_count(), 1);
    }

    #[test]
    fn test_quarantine_path() {
        assert_eq!(
            quarantine_path(Path::new("/tmp/acc-v1.tape")),
            PathBuf::from("/tmp/acc-v1.tape.corrupt")
        );
    }
}
