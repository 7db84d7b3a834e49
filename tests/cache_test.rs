use serde_json::json;
use spool_forwarder::cache::{CacheConfig, CacheStore};
use spool_forwarder::domain::{Record, RecordKey, Topic};
use spool_forwarder::storage::MINIMUM_LENGTH;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn record(i: usize) -> Record {
    Record::new(
        RecordKey::new(Some("study".to_string()), "alice", "phone"),
        json!({ "i": i, "payload": "x".repeat(64) }),
    )
}

#[test]
fn test_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let topic = Topic::new("acceleration", 3);
    {
        let store = CacheStore::new(dir.path(), CacheConfig::default()).unwrap();
        let group = store.get_or_create(&topic).unwrap();
        let records: Vec<Record> = (0..20).map(record).collect();
        assert_eq!(group.active().add_all(&records).unwrap(), 20);
        store.close();
    }

    let store = CacheStore::new(dir.path(), CacheConfig::default()).unwrap();
    let group = store.get_or_create(&topic).unwrap();
    let cache = group.active();
    assert_eq!(cache.unsent_count(), 20);
    assert!(dir.path().join("acceleration-v3.tape").exists());

    let batch = cache.unsent_records(5, u64::MAX).unwrap().unwrap();
    assert_eq!(batch.len(), 5);
    assert_eq!(batch.values[0]["i"], 0);
    assert_eq!(batch.topic, topic);
}

#[test]
fn test_other_versions_become_deprecated() {
    let dir = TempDir::new().unwrap();
    {
        let store = CacheStore::new(dir.path(), CacheConfig::default()).unwrap();
        for version in [1, 2] {
            let group = store.get_or_create(&Topic::new("battery", version)).unwrap();
            group.active().add(&record(version as usize)).unwrap();
            store.remove("battery");
        }
        let other = store.get_or_create(&Topic::new("gyroscope", 1)).unwrap();
        other.active().add(&record(0)).unwrap();
        store.close();
    }

    let store = CacheStore::new(dir.path(), CacheConfig::default()).unwrap();
    let group = store.get_or_create(&Topic::new("battery", 3)).unwrap();
    let deprecated: Vec<u32> = group
        .deprecated()
        .iter()
        .map(|cache| cache.topic().version)
        .collect();
    assert_eq!(deprecated, vec![1, 2]);
    assert_eq!(group.caches().len(), 3);
    assert_eq!(group.active().topic().version, 3);
    assert!(store.get("gyroscope").is_none());
}

#[test]
fn test_empty_deprecated_caches_are_deleted() {
    let dir = TempDir::new().unwrap();
    {
        let store = CacheStore::new(dir.path(), CacheConfig::default()).unwrap();
        let group = store.get_or_create(&Topic::new("battery", 1)).unwrap();
        group.active().add_all(&[record(0), record(1)]).unwrap();
        store.close();
    }

    let store = CacheStore::new(dir.path(), CacheConfig::default()).unwrap();
    let group = store.get_or_create(&Topic::new("battery", 2)).unwrap();
    let old = group.deprecated().remove(0);

    group.delete_empty_caches();
    assert_eq!(group.deprecated().len(), 1, "still holds records");

    old.remove(2).unwrap();
    group.delete_empty_caches();
    assert!(group.deprecated().is_empty());
    assert!(!dir.path().join("battery-v1.tape").exists());
}

#[test]
fn test_corrupt_file_is_quarantined() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("battery-v1.tape");
    std::fs::write(&path, vec![0xab; MINIMUM_LENGTH as usize]).unwrap();

    let store = CacheStore::new(dir.path(), CacheConfig::default()).unwrap();
    let group = store.get_or_create(&Topic::new("battery", 1)).unwrap();

    assert_eq!(group.active().unsent_count(), 0);
    group.active().add(&record(1)).unwrap();
    assert!(dir.path().join("battery-v1.tape.corrupt").exists());
}

#[test]
fn test_full_cache_reports_queue_full() {
    let dir = TempDir::new().unwrap();
    let store = CacheStore::new(
        dir.path(),
        CacheConfig {
            maximum_size: MINIMUM_LENGTH,
        },
    )
    .unwrap();
    let group = store.get_or_create(&Topic::new("battery", 1)).unwrap();

    let mut added = 0;
    let err = loop {
        match group.active().add(&record(added)) {
            Ok(()) => added += 1,
            Err(e) => break e,
        }
    };
    assert!(err.is_queue_full());
    assert!(added > 0);
    assert_eq!(group.active().unsent_count(), added);
    assert_eq!(group.active().file_size(), MINIMUM_LENGTH);
}

#[test]
fn test_concurrent_producer_and_drainer() {
    let dir = TempDir::new().unwrap();
    let store = CacheStore::new(dir.path(), CacheConfig::default()).unwrap();
    let cache = Arc::clone(store.get_or_create(&Topic::new("battery", 1)).unwrap().active());

    let producer = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            for i in 0..500 {
                cache.add(&record(i)).unwrap();
            }
        })
    };

    let mut next = 0;
    while next < 500 {
        if let Some(batch) = cache.unsent_records(50, u64::MAX).unwrap() {
            for value in &batch.values {
                assert_eq!(value["i"], next);
                next += 1;
            }
            assert_eq!(cache.remove(batch.len()).unwrap(), batch.len());
        } else {
            thread::yield_now();
        }
    }
    producer.join().unwrap();
    assert_eq!(cache.unsent_count(), 0);
}
