//! Raw KV scenarios: snapshot reads across commits, delete semantics,
//! range-delete boundaries and scan paging.

use std::sync::Arc;
use std::time::Duration;

use rangekv_core::config::Config;
use rangekv_core::coordinator::NoopCoordinator;
use rangekv_core::error::StoreError;
use rangekv_core::ts::LocalTsSource;
use rangekv_core::types::{KeyValue, Range, RangeWithOptions, RegionType, ScalarSchema};
use rangekv_region::{RegionDescriptor, RegionRegistry, RegionStore};
use tempfile::TempDir;

fn open_registry() -> (TempDir, RegionRegistry) {
    let tmp = TempDir::new().unwrap();
    let registry = RegionRegistry::open(
        tmp.path(),
        Config::default(),
        Arc::new(LocalTsSource::new()),
        Arc::new(NoopCoordinator),
    )
    .unwrap();
    (tmp, registry)
}

fn kv_region(registry: &RegionRegistry) -> Arc<RegionStore> {
    registry
        .create_region(RegionDescriptor {
            id: 1,
            region_type: RegionType::Kv,
            partition_id: 1,
            txn_enabled: false,
            user_start: Vec::new(),
            user_end: Vec::new(),
            schema: ScalarSchema::default(),
            index_params: None,
        })
        .unwrap()
}

#[test]
fn test_snapshot_read_across_commits() {
    let (_tmp, registry) = open_registry();
    let store = kv_region(&registry);

    let ts1 = store.kv_put(&[KeyValue::new(b"a".to_vec(), b"1".to_vec())]).unwrap();
    let ts2 = store.kv_put(&[KeyValue::new(b"a".to_vec(), b"2".to_vec())]).unwrap();
    assert!(ts2 > ts1);

    // Before the first write: not found.
    assert!(matches!(
        store.kv_get(ts1 - 1, b"a"),
        Err(StoreError::KeyNotFound)
    ));
    // Between the writes: the first value.
    assert_eq!(store.kv_get(ts1, b"a").unwrap(), b"1".to_vec());
    assert_eq!(store.kv_get(ts2 - 1, b"a").unwrap(), b"1".to_vec());
    // At and after the second write: the second value.
    assert_eq!(store.kv_get(ts2, b"a").unwrap(), b"2".to_vec());
    assert_eq!(store.kv_get(0, b"a").unwrap(), b"2".to_vec());
}

#[test]
fn test_reads_at_fixed_ts_are_stable() {
    let (_tmp, registry) = open_registry();
    let store = kv_region(&registry);

    let ts = store.kv_put(&[KeyValue::new(b"k".to_vec(), b"v1".to_vec())]).unwrap();
    let first = store.kv_get(ts, b"k").unwrap();
    // A concurrent newer commit must not change the view at `ts`.
    store.kv_put(&[KeyValue::new(b"k".to_vec(), b"v2".to_vec())]).unwrap();
    let second = store.kv_get(ts, b"k").unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_delete_then_put() {
    let (_tmp, registry) = open_registry();
    let store = kv_region(&registry);

    store.kv_put(&[KeyValue::new(b"k".to_vec(), b"v".to_vec())]).unwrap();
    let del_ts = store.kv_delete(&[b"k".to_vec()]).unwrap();
    assert!(matches!(
        store.kv_get(del_ts, b"k"),
        Err(StoreError::KeyNotFound)
    ));

    store.kv_put(&[KeyValue::new(b"k".to_vec(), b"v2".to_vec())]).unwrap();
    assert_eq!(store.kv_get(0, b"k").unwrap(), b"v2".to_vec());
}

#[test]
fn test_put_is_idempotent_at_same_value() {
    let (_tmp, registry) = open_registry();
    let store = kv_region(&registry);

    store.kv_put(&[KeyValue::new(b"k".to_vec(), b"v".to_vec())]).unwrap();
    store.kv_put(&[KeyValue::new(b"k".to_vec(), b"v".to_vec())]).unwrap();
    assert_eq!(store.kv_get(0, b"k").unwrap(), b"v".to_vec());
    assert_eq!(store.kv_count(0, &Range::default()).unwrap(), 1);
}

#[test]
fn test_batch_get_reports_per_key_misses() {
    let (_tmp, registry) = open_registry();
    let store = kv_region(&registry);

    store.kv_put(&[KeyValue::new(b"a".to_vec(), b"1".to_vec())]).unwrap();
    let values = store
        .kv_batch_get(0, &[b"a".to_vec(), b"missing".to_vec()])
        .unwrap();
    assert_eq!(values[0], Some(b"1".to_vec()));
    assert_eq!(values[1], None);
}

#[test]
fn test_empty_key_rejected() {
    let (_tmp, registry) = open_registry();
    let store = kv_region(&registry);
    assert!(matches!(
        store.kv_get(0, b""),
        Err(StoreError::KeyEmpty)
    ));
    assert!(matches!(
        store.kv_put(&[KeyValue::new(Vec::new(), b"v".to_vec())]),
        Err(StoreError::KeyEmpty)
    ));
}

#[test]
fn test_delete_range_boundaries() {
    let (_tmp, registry) = open_registry();
    let store = kv_region(&registry);

    for key in [b"a", b"b", b"c"] {
        store.kv_put(&[KeyValue::new(key.to_vec(), b"v".to_vec())]).unwrap();
    }

    // Empty resolved range: no-op, success.
    store
        .kv_delete_range(&RangeWithOptions {
            range: Range::new(b"b".to_vec(), b"b".to_vec()),
            with_start: true,
            with_end: false,
        })
        .unwrap();
    assert_eq!(store.kv_get(0, b"b").unwrap(), b"v".to_vec());

    // start == end with both bounds: deletes exactly that key.
    store
        .kv_delete_range(&RangeWithOptions {
            range: Range::new(b"b".to_vec(), b"b".to_vec()),
            with_start: true,
            with_end: true,
        })
        .unwrap();
    assert!(matches!(
        store.kv_get(0, b"b"),
        Err(StoreError::KeyNotFound)
    ));
    assert_eq!(store.kv_get(0, b"a").unwrap(), b"v".to_vec());
    assert_eq!(store.kv_get(0, b"c").unwrap(), b"v".to_vec());

    // The reserved end-of-keyspace bound is refused.
    assert!(matches!(
        store.kv_delete_range(&RangeWithOptions {
            range: Range::new(b"a".to_vec(), vec![0xFF; 8]),
            with_start: true,
            with_end: false,
        }),
        Err(StoreError::RangeInvalid(_))
    ));
}

#[test]
fn test_scan_paging_and_reverse() {
    let (_tmp, registry) = open_registry();
    let store = kv_region(&registry);

    for i in 0..10u8 {
        store
            .kv_put(&[KeyValue::new(vec![b'k', b'0' + i], vec![i])])
            .unwrap();
    }
    store.kv_delete(&[b"k3".to_vec()]).unwrap();

    let page = store.kv_scan(0, &Range::default(), 4, false, false).unwrap();
    assert_eq!(page.kvs.len(), 4);
    assert!(page.has_more);
    assert_eq!(page.end_key, b"k4".to_vec(), "k3 is deleted and skipped");

    let rest = store
        .kv_scan(
            0,
            &Range::new(rangekv_core::types::next_key(&page.end_key), Vec::new()),
            0,
            false,
            false,
        )
        .unwrap();
    assert_eq!(rest.kvs.len(), 5);
    assert!(!rest.has_more);

    let reverse = store.kv_scan(0, &Range::default(), 3, true, true).unwrap();
    let keys: Vec<Vec<u8>> = reverse.kvs.iter().map(|kv| kv.key.clone()).collect();
    assert_eq!(keys, vec![b"k9".to_vec(), b"k8".to_vec(), b"k7".to_vec()]);
    assert!(reverse.kvs.iter().all(|kv| kv.value.is_empty()), "key_only");
}

#[test]
fn test_region_lifecycle_and_drain() {
    let (_tmp, registry) = open_registry();
    let store = kv_region(&registry);
    store.kv_put(&[KeyValue::new(b"k".to_vec(), b"v".to_vec())]).unwrap();

    // A second strong handle keeps the region from draining.
    let held = registry.get(1).unwrap();
    assert!(registry
        .drop_region(1, Duration::from_millis(50))
        .is_err());
    drop(held);
    drop(store);

    // Re-register is required for the id to resolve again.
    assert!(matches!(
        registry.get(1),
        Err(StoreError::RegionNotFound(1))
    ));
}

#[test]
fn test_checkpoint_and_ttl() {
    let (_tmp, registry) = open_registry();
    let store = kv_region(&registry);

    store
        .kv_put_with_ttl(&[KeyValue::new(b"short".to_vec(), b"v".to_vec())], -1)
        .unwrap();
    store
        .kv_put_with_ttl(&[KeyValue::new(b"long".to_vec(), b"v".to_vec())], 60_000)
        .unwrap();
    assert!(matches!(
        store.kv_get(0, b"short"),
        Err(StoreError::KeyNotFound)
    ));
    assert_eq!(store.kv_get(0, b"long").unwrap(), b"v".to_vec());

    store.raw_store().flush_all().unwrap();
    let out = TempDir::new().unwrap();
    let metas = store.checkpoint(&out.path().join("checkpoint_1")).unwrap();
    assert!(!metas.is_empty());
}
