//! Transaction scenarios: two-phase commit, pessimistic retry, rollback
//! hygiene and status checks, driven through the region surface.

use std::sync::Arc;

use rangekv_core::config::Config;
use rangekv_core::coordinator::NoopCoordinator;
use rangekv_core::error::StoreError;
use rangekv_core::ts::LocalTsSource;
use rangekv_core::types::{OpContext, Range, RegionType, ScalarSchema};
use rangekv_region::{RegionDescriptor, RegionRegistry, RegionStore};
use rangekv_storage::txn::{Mutation, PrewriteRequest, TxnStatus};
use tempfile::TempDir;

fn open_txn_region() -> (TempDir, RegionRegistry, Arc<RegionStore>) {
    let tmp = TempDir::new().unwrap();
    let registry = RegionRegistry::open(
        tmp.path(),
        Config::default(),
        Arc::new(LocalTsSource::new()),
        Arc::new(NoopCoordinator),
    )
    .unwrap();
    let store = registry
        .create_region(RegionDescriptor {
            id: 10,
            region_type: RegionType::Kv,
            partition_id: 1,
            txn_enabled: true,
            user_start: Vec::new(),
            user_end: Vec::new(),
            schema: ScalarSchema::default(),
            index_params: None,
        })
        .unwrap();
    (tmp, registry, store)
}

fn prewrite(store: &RegionStore, kvs: &[(&[u8], &[u8])], primary: &[u8], start_ts: i64) {
    store
        .txn_prewrite(PrewriteRequest {
            mutations: kvs
                .iter()
                .map(|(k, v)| Mutation::put(k.to_vec(), v.to_vec()))
                .collect(),
            primary: primary.to_vec(),
            start_ts,
            lock_ttl_ms: 1000,
            ..Default::default()
        })
        .unwrap();
}

#[test]
fn test_two_phase_commit_happy_path() {
    let (_tmp, _registry, store) = open_txn_region();

    prewrite(&store, &[(b"x", b"1"), (b"y", b"2")], b"x", 10);

    // A read under the lock is refused.
    assert!(matches!(
        store.txn_get(10, b"x"),
        Err(StoreError::KeyIsLocked { .. })
    ));

    store
        .txn_commit(&[b"x".to_vec(), b"y".to_vec()], 10, 11)
        .unwrap();

    assert_eq!(store.txn_get(11, b"x").unwrap(), b"1".to_vec());
    assert_eq!(store.txn_get(11, b"y").unwrap(), b"2".to_vec());
    assert!(matches!(
        store.txn_get(10, b"x"),
        Err(StoreError::KeyNotFound)
    ));

    // Invariant: no lock remains, exactly one write record per key.
    assert!(store
        .txn_scan_lock(0, &Range::default(), 0)
        .unwrap()
        .is_empty());
    let dump = store.txn_dump().unwrap();
    assert_eq!(dump.writes.len(), 2);
    assert!(dump
        .writes
        .iter()
        .all(|(_, commit_ts, record)| *commit_ts == 11 && record.start_ts == 10));
}

#[test]
fn test_pessimistic_retry_on_write_conflict() {
    let (_tmp, _registry, store) = open_txn_region();

    // Txn A locks k.
    store
        .txn_pessimistic_lock(&[b"k".to_vec()], b"k", 10, 10, 1000)
        .unwrap();

    // Txn B is refused while A holds the lock.
    assert!(matches!(
        store.txn_pessimistic_lock(&[b"k".to_vec()], b"k", 11, 11, 1000),
        Err(StoreError::KeyIsLocked { lock_ts: 10, .. })
    ));

    // A prewrites (pessimistic) and commits at 12.
    store
        .txn_prewrite(PrewriteRequest {
            mutations: vec![Mutation::put(b"k".to_vec(), b"a".to_vec())],
            primary: b"k".to_vec(),
            start_ts: 10,
            lock_ttl_ms: 1000,
            pessimistic_checks: vec![true],
            for_update_ts: 10,
            ..Default::default()
        })
        .unwrap();
    store.txn_commit(&[b"k".to_vec()], 10, 12).unwrap();

    // B retried with a stale for_update_ts conflicts...
    assert!(matches!(
        store.txn_pessimistic_lock(&[b"k".to_vec()], b"k", 11, 11, 1000),
        Err(StoreError::WriteConflict { conflict_ts: 12, .. })
    ));
    // ...and succeeds with a refreshed one.
    store
        .txn_pessimistic_lock(&[b"k".to_vec()], b"k", 11, 13, 1000)
        .unwrap();
    store
        .txn_pessimistic_rollback(&[b"k".to_vec()], 11, 13)
        .unwrap();
}

#[test]
fn test_prewrite_rollback_leaves_nothing_visible() {
    let (_tmp, _registry, store) = open_txn_region();

    prewrite(&store, &[(b"r", b"v")], b"r", 20);
    store.txn_batch_rollback(&[b"r".to_vec()], 20).unwrap();

    assert!(store
        .txn_scan_lock(0, &Range::default(), 0)
        .unwrap()
        .is_empty());
    assert!(matches!(
        store.txn_get(100, b"r"),
        Err(StoreError::KeyNotFound)
    ));
    // The only trace is the rollback tombstone, invisible to reads.
    let dump = store.txn_dump().unwrap();
    assert!(dump.datas.is_empty());
}

#[test]
fn test_resolve_lock_commits_or_rolls_back() {
    let (_tmp, _registry, store) = open_txn_region();

    prewrite(&store, &[(b"x", b"1"), (b"y", b"2")], b"x", 30);
    // Resolve with a commit_ts commits every lock of the txn.
    store.txn_resolve_lock(30, 31, &[]).unwrap();
    assert_eq!(store.txn_get(31, b"y").unwrap(), b"2".to_vec());

    prewrite(&store, &[(b"z", b"3")], b"z", 40);
    // Resolve with commit_ts 0 rolls back.
    store.txn_resolve_lock(40, 0, &[]).unwrap();
    assert!(matches!(
        store.txn_get(50, b"z"),
        Err(StoreError::KeyNotFound)
    ));
}

#[test]
fn test_check_txn_status_paths() {
    let (_tmp, _registry, store) = open_txn_region();

    prewrite(&store, &[(b"p", b"v")], b"p", 50);
    assert_eq!(
        store.txn_check_txn_status(b"p", 50, 60, 51).unwrap(),
        TxnStatus::Locked { ttl_ms: 1000 }
    );

    store.txn_commit(&[b"p".to_vec()], 50, 55).unwrap();
    assert_eq!(
        store.txn_check_txn_status(b"p", 50, 60, 70).unwrap(),
        TxnStatus::Committed { commit_ts: 55 }
    );

    // A transaction nobody ever saw is rolled back lazily.
    assert_eq!(
        store.txn_check_txn_status(b"q", 80, 90, 100).unwrap(),
        TxnStatus::RolledBack
    );
}

#[test]
fn test_check_secondary_locks() {
    let (_tmp, _registry, store) = open_txn_region();

    store
        .txn_prewrite(PrewriteRequest {
            mutations: vec![
                Mutation::put(b"pri".to_vec(), b"1".to_vec()),
                Mutation::put(b"sec".to_vec(), b"2".to_vec()),
            ],
            primary: b"pri".to_vec(),
            start_ts: 60,
            lock_ttl_ms: 1000,
            secondaries: vec![b"sec".to_vec()],
            ..Default::default()
        })
        .unwrap();

    let status = store
        .txn_check_secondary_locks(&[b"sec".to_vec()], 60)
        .unwrap();
    assert_eq!(status.locks.len(), 1);
    assert_eq!(status.commit_ts, 0);

    store
        .txn_commit(&[b"pri".to_vec(), b"sec".to_vec()], 60, 61)
        .unwrap();
    let status = store
        .txn_check_secondary_locks(&[b"sec".to_vec()], 60)
        .unwrap();
    assert!(status.locks.is_empty());
    assert_eq!(status.commit_ts, 61);
}

#[test]
fn test_heartbeat_and_scan() {
    let (_tmp, _registry, store) = open_txn_region();

    prewrite(&store, &[(b"h", b"v")], b"h", 70);
    assert_eq!(store.txn_heart_beat(b"h", 70, 9000).unwrap(), 9000);
    store.txn_commit(&[b"h".to_vec()], 70, 71).unwrap();

    prewrite(&store, &[(b"i", b"w")], b"i", 80);
    store.txn_commit(&[b"i".to_vec()], 80, 81).unwrap();

    let ctx = OpContext::none();
    let page = store.txn_scan(100, &Range::default(), 0, false, &ctx).unwrap();
    let keys: Vec<Vec<u8>> = page.kvs.iter().map(|kv| kv.key.clone()).collect();
    assert_eq!(keys, vec![b"h".to_vec(), b"i".to_vec()]);

    // A scan below the second commit sees only the first.
    let page = store.txn_scan(75, &Range::default(), 0, false, &ctx).unwrap();
    assert_eq!(page.kvs.len(), 1);
}

#[test]
fn test_gc_respects_safe_point() {
    let (_tmp, _registry, store) = open_txn_region();

    for (ts, value) in [(10_i64, "v1"), (20, "v2"), (30, "v3")] {
        prewrite(&store, &[(b"g", value.as_bytes())], b"g", ts);
        store.txn_commit(&[b"g".to_vec()], ts, ts + 1).unwrap();
    }

    let ctx = OpContext::none();
    store.txn_gc(25, &ctx).unwrap();

    // Visible history at and above the safe point is intact.
    assert_eq!(store.txn_get(25, b"g").unwrap(), b"v2".to_vec());
    assert_eq!(store.txn_get(40, b"g").unwrap(), b"v3".to_vec());
    // Pre-safe-point history is gone.
    assert!(matches!(
        store.txn_get(15, b"g"),
        Err(StoreError::KeyNotFound)
    ));
}

#[test]
fn test_txn_delete_range() {
    let (_tmp, _registry, store) = open_txn_region();

    for key in [b"a", b"b", b"c"] {
        prewrite(&store, &[(key.as_slice(), b"v")], key, 10);
        store.txn_commit(&[key.to_vec()], 10, 11).unwrap();
    }
    store
        .txn_delete_range(&Range::new(b"a".to_vec(), b"c".to_vec()))
        .unwrap();
    assert!(matches!(store.txn_get(20, b"a"), Err(StoreError::KeyNotFound)));
    assert!(matches!(store.txn_get(20, b"b"), Err(StoreError::KeyNotFound)));
    assert_eq!(store.txn_get(20, b"c").unwrap(), b"v".to_vec());
}
