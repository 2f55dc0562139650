//! Tests for the segment store, cache manager and repository.

use bytes::Bytes;
use nimbus_types::{DataPointer, NodeName, SegmentKey, TenantId, Timestamp, ValueRecord};
use tempfile::TempDir;

use crate::*;

fn pointer(timestamp: u64, size: u64) -> ValueRecord {
    ValueRecord::DataPointer(DataPointer {
        timestamp: Timestamp::from_nanos(timestamp),
        segment_number: 0,
        segment_size: size,
        encoded_size: size,
        total_size: size,
        checksum_adler32: 0,
        checksum_md5: [0; 16],
    })
}

fn key(name: &str, segment: u8) -> SegmentKey {
    SegmentKey::new(TenantId::new(42), Bytes::copy_from_slice(name.as_bytes()), 0, segment)
}

fn open_store(dir: &TempDir) -> SegmentStore {
    SegmentStore::open(dir.path().join("42.redb"), TenantId::new(42)).unwrap()
}

fn repository_with_node(node: &str) -> (TempDir, NodeName) {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join(node)).unwrap();
    (dir, NodeName::new(node))
}

// ============================================================================
// SegmentStore
// ============================================================================

#[test]
fn test_upsert_reports_ignored_stale_record() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let k1 = key("k1", 0);

    assert_eq!(
        store.upsert(&k1, &pointer(200, 10)).unwrap(),
        InsertOutcome::Applied { previous_size: 0 }
    );

    let stale = store.upsert(&k1, &pointer(100, 99)).unwrap();
    assert_eq!(
        stale,
        InsertOutcome::Ignored {
            current: Timestamp::from_nanos(200)
        }
    );
    assert!(!stale.is_applied());
    assert_eq!(stale.previous_size(), 0);

    // Replaying the current record is ignored too.
    assert!(!store.upsert(&k1, &pointer(200, 10)).unwrap().is_applied());
    assert_eq!(store.lookup(&k1).unwrap(), Some(pointer(200, 10)));
}

#[test]
fn test_insert_lookup_delete_scenario() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let k1 = key("k1", 0);

    assert_eq!(store.insert(&k1, &pointer(1, 1000)).unwrap(), 0);
    assert_eq!(store.lookup(&k1).unwrap().map(|r| r.size()), Some(1000));

    assert_eq!(store.insert(&k1, &pointer(2, 2000)).unwrap(), 1000);
    assert_eq!(store.lookup(&k1).unwrap(), Some(pointer(2, 2000)));

    assert_eq!(store.delete(&k1, Timestamp::from_nanos(3)).unwrap(), 2000);
    assert_eq!(
        store.lookup(&k1).unwrap(),
        Some(ValueRecord::Tombstone {
            timestamp: Timestamp::from_nanos(3)
        })
    );
}

#[test]
fn test_never_written_differs_from_tombstone() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.delete(&key("gone", 0), Timestamp::from_nanos(1)).unwrap();

    let missing = store.lookup(&key("never", 0)).unwrap();
    let deleted = store.lookup(&key("gone", 0)).unwrap();
    assert_eq!(missing, None);
    assert!(deleted.is_some_and(|r| r.is_tombstone()));
    assert_ne!(missing, deleted);
}

#[test]
fn test_insert_after_tombstone_reports_zero() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let k = key("k", 0);

    store.insert(&k, &pointer(1, 500)).unwrap();
    store.delete(&k, Timestamp::from_nanos(2)).unwrap();
    assert_eq!(store.insert(&k, &pointer(3, 700)).unwrap(), 0);
}

#[test]
fn test_stale_record_is_ignored() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let k = key("k", 0);

    store.insert(&k, &pointer(10, 100)).unwrap();
    assert_eq!(store.insert(&k, &pointer(5, 999)).unwrap(), 0);
    assert_eq!(store.insert(&k, &pointer(10, 999)).unwrap(), 0);
    assert_eq!(store.lookup(&k).unwrap(), Some(pointer(10, 100)));
}

#[test]
fn test_segments_are_distinct_slots() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.insert(&key("k", 0), &pointer(1, 10)).unwrap();
    store.insert(&key("k", 1), &pointer(1, 20)).unwrap();
    assert_eq!(store.lookup(&key("k", 0)).unwrap().map(|r| r.size()), Some(10));
    assert_eq!(store.lookup(&key("k", 1)).unwrap().map(|r| r.size()), Some(20));
}

#[test]
fn test_tenant_mismatch_rejected() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let other = SegmentKey::new(TenantId::new(7), Bytes::from_static(b"k"), 0, 0);

    assert!(matches!(
        store.insert(&other, &pointer(1, 1)),
        Err(StoreError::TenantMismatch { .. })
    ));
}

#[test]
fn test_list_prefix_order_and_cursor() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    for name in ["b/2", "a/1", "b/1", "b/10", "c", "b"] {
        store.insert(&key(name, 0), &pointer(1, 1)).unwrap();
    }
    store.delete(&key("b/3", 0), Timestamp::from_nanos(1)).unwrap();

    let all = store.list(b"b/", None, 0).unwrap();
    let names: Vec<_> = all.entries.iter().map(|(k, _)| k.key.clone()).collect();
    assert_eq!(
        names,
        vec![
            Bytes::from_static(b"b/1"),
            Bytes::from_static(b"b/10"),
            Bytes::from_static(b"b/2"),
            Bytes::from_static(b"b/3"),
        ]
    );
    assert!(all.entries[3].1.is_tombstone());
    assert_eq!(all.next_cursor, None);

    let first = store.list(b"b/", None, 2).unwrap();
    assert_eq!(first.entries.len(), 2);
    let cursor = first.next_cursor.unwrap();

    let second = store.list(b"b/", Some(&cursor), 2).unwrap();
    let names: Vec<_> = second.entries.iter().map(|(k, _)| k.key.clone()).collect();
    assert_eq!(names, vec![Bytes::from_static(b"b/2"), Bytes::from_static(b"b/3")]);
    assert_eq!(second.next_cursor, None);
}

#[test]
fn test_list_empty_prefix_lists_everything() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.insert(&key("x", 0), &pointer(1, 1)).unwrap();
    store.insert(&key("", 3), &pointer(1, 1)).unwrap();

    let page = store.list(b"", None, 0).unwrap();
    assert_eq!(page.entries.len(), 2);
    assert_eq!(page.entries[0].0.key, Bytes::new());
}

#[test]
fn test_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        store.insert(&key("k", 0), &pointer(1, 77)).unwrap();
    }
    let store = open_store(&dir);
    assert_eq!(store.lookup(&key("k", 0)).unwrap(), Some(pointer(1, 77)));
}

// ============================================================================
// CacheManager
// ============================================================================

#[test]
fn test_acquire_missing_node_is_unavailable() {
    let dir = TempDir::new().unwrap();
    let cache = CacheManager::new(CacheConfig::new(dir.path()));

    let err = cache
        .acquire(&NodeName::new("missing"), TenantId::new(1))
        .unwrap_err();
    assert!(matches!(err, StoreError::Unavailable { .. }));
    assert!(err.is_unavailable());
}

#[test]
fn test_database_path_layout() {
    let (dir, node) = repository_with_node("node-a");
    let cache = CacheManager::new(CacheConfig::new(dir.path()));

    let handle = cache.acquire(&node, TenantId::new(9)).unwrap();
    assert_eq!(
        handle.path(),
        dir.path().join("node-a").join("databases").join("9.redb")
    );
    assert!(handle.path().exists());
}

#[test]
fn test_lru_bound_and_eviction_order() {
    let (dir, node) = repository_with_node("node-a");
    let cache = CacheManager::new(CacheConfig::new(dir.path()).with_capacity(3));

    for tenant in 1..=3 {
        let handle = cache.acquire(&node, TenantId::new(tenant)).unwrap();
        cache.release(handle);
    }
    // Touch 1 so that 2 becomes least recently used.
    cache.release(cache.acquire(&node, TenantId::new(1)).unwrap());

    cache.release(cache.acquire(&node, TenantId::new(4)).unwrap());

    assert_eq!(cache.open_count(), 3);
    assert!(cache.is_open(&node, TenantId::new(1)));
    assert!(!cache.is_open(&node, TenantId::new(2)));
    assert!(cache.is_open(&node, TenantId::new(3)));
    assert!(cache.is_open(&node, TenantId::new(4)));
}

#[test]
fn test_evicted_collection_reopens_with_same_data() {
    let (dir, node) = repository_with_node("node-a");
    let cache = CacheManager::new(CacheConfig::new(dir.path()).with_capacity(1));
    let k = SegmentKey::new(TenantId::new(1), Bytes::from_static(b"k"), 0, 0);

    {
        let handle = cache.acquire(&node, TenantId::new(1)).unwrap();
        handle.insert(&k, &pointer(1, 1234)).unwrap();
    }
    cache.release(cache.acquire(&node, TenantId::new(2)).unwrap());
    assert!(!cache.is_open(&node, TenantId::new(1)));

    let handle = cache.acquire(&node, TenantId::new(1)).unwrap();
    assert_eq!(handle.lookup(&k).unwrap(), Some(pointer(1, 1234)));
}

#[test]
fn test_acquired_handles_are_not_evicted() {
    let (dir, node) = repository_with_node("node-a");
    let cache = CacheManager::new(CacheConfig::new(dir.path()).with_capacity(1));

    let held = cache.acquire(&node, TenantId::new(1)).unwrap();
    let other = cache.acquire(&node, TenantId::new(2)).unwrap();
    assert_eq!(cache.open_count(), 2);

    cache.release(other);
    assert_eq!(cache.open_count(), 1);
    assert!(cache.is_open(&node, TenantId::new(1)));

    let k = SegmentKey::new(TenantId::new(1), Bytes::from_static(b"k"), 0, 0);
    held.insert(&k, &pointer(1, 1)).unwrap();
}

#[test]
fn test_same_collection_shares_handle() {
    let (dir, node) = repository_with_node("node-a");
    let cache = CacheManager::new(CacheConfig::new(dir.path()));

    let a = cache.acquire(&node, TenantId::new(5)).unwrap();
    let b = cache.acquire(&node, TenantId::new(5)).unwrap();
    let k = SegmentKey::new(TenantId::new(5), Bytes::from_static(b"k"), 0, 0);

    a.insert(&k, &pointer(1, 10)).unwrap();
    assert_eq!(b.lookup(&k).unwrap(), Some(pointer(1, 10)));
    assert_eq!(cache.open_count(), 1);
}

#[test]
fn test_shutdown_closes_and_rejects() {
    let (dir, node) = repository_with_node("node-a");
    let cache = CacheManager::new(CacheConfig::new(dir.path()));

    cache.release(cache.acquire(&node, TenantId::new(1)).unwrap());
    cache.shutdown();

    assert_eq!(cache.open_count(), 0);
    assert!(matches!(
        cache.acquire(&node, TenantId::new(1)),
        Err(StoreError::ShutDown)
    ));
}

// ============================================================================
// SegmentRepository
// ============================================================================

#[test]
fn test_repository_write_read_remove() {
    let (dir, node) = repository_with_node("node-a");
    let repository = SegmentRepository::new(dir.path(), &node);
    let k = key("object", 3);
    let ts = Timestamp::from_nanos(99);

    let path = repository.write(&k, ts, b"segment bytes").unwrap();
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert_eq!(name, format!("{:x}.0.3.99", md5::compute(b"object")));
    assert!(path.starts_with(dir.path().join("node-a").join("segments").join("42")));

    assert_eq!(
        repository.read(&k, ts).unwrap(),
        Some(Bytes::from_static(b"segment bytes"))
    );
    assert_eq!(repository.read(&k, Timestamp::from_nanos(100)).unwrap(), None);

    assert!(repository.remove(&k, ts).unwrap());
    assert!(!repository.remove(&k, ts).unwrap());
}

#[test]
fn test_repository_rewrite_replaces() {
    let (dir, node) = repository_with_node("node-a");
    let repository = SegmentRepository::new(dir.path(), &node);
    let k = key("object", 0);
    let ts = Timestamp::from_nanos(1);

    repository.write(&k, ts, b"first").unwrap();
    repository.write(&k, ts, b"second").unwrap();
    assert_eq!(repository.read(&k, ts).unwrap(), Some(Bytes::from_static(b"second")));
}

// ============================================================================
// Property-Based Tests
// ============================================================================

mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn newest_record_wins_regardless_of_order(
            writes in proptest::collection::vec((1u64..50, 1u64..10_000), 1..12),
        ) {
            let dir = TempDir::new().unwrap();
            let store = open_store(&dir);
            let k = key("prop", 0);

            for (ts, size) in &writes {
                store.insert(&k, &pointer(*ts, *size)).unwrap();
            }

            let max_ts = writes.iter().map(|(ts, _)| *ts).max().unwrap();
            let winner = writes.iter().find(|(ts, _)| *ts == max_ts).unwrap();
            prop_assert_eq!(store.lookup(&k).unwrap(), Some(pointer(winner.0, winner.1)));
        }

        #[test]
        fn second_newer_insert_reports_first_size(
            t1 in 1u64..1000,
            delta in 1u64..1000,
            s1 in any::<u32>(),
            s2 in any::<u32>(),
        ) {
            let dir = TempDir::new().unwrap();
            let store = open_store(&dir);
            let k = key("prop", 0);

            prop_assert_eq!(store.insert(&k, &pointer(t1, u64::from(s1))).unwrap(), 0);
            prop_assert_eq!(
                store.insert(&k, &pointer(t1 + delta, u64::from(s2))).unwrap(),
                u64::from(s1)
            );
            prop_assert_eq!(store.lookup(&k).unwrap(), Some(pointer(t1 + delta, u64::from(s2))));
        }
    }
}
