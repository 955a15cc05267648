//! Split-checker scenarios: policy walk, post-validation and the single
//! dispatched coordinator call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rangekv_core::config::{Config, SplitPolicy};
use rangekv_core::coordinator::Coordinator;
use rangekv_core::error::StoreResult;
use rangekv_core::ts::LocalTsSource;
use rangekv_core::types::{KeyValue, RegionId, RegionType, ScalarSchema};
use rangekv_region::{RegionDescriptor, RegionRegistry, RegionStore};
use tempfile::TempDir;

#[derive(Default)]
struct RecordingCoordinator {
    splits: Mutex<Vec<(RegionId, Vec<u8>)>>,
    read_only: std::sync::atomic::AtomicBool,
}

impl Coordinator for RecordingCoordinator {
    fn split_region(&self, region_id: RegionId, split_key: &[u8]) -> StoreResult<()> {
        self.splits.lock().push((region_id, split_key.to_vec()));
        Ok(())
    }

    fn cluster_read_only(&self) -> bool {
        self.read_only.load(std::sync::atomic::Ordering::Acquire)
    }
}

const KEY_COUNT: usize = 512;
const VALUE_SIZE: usize = 8 * 1024;

fn split_config() -> Config {
    let mut config = Config::default();
    config.split.policy = SplitPolicy::Half;
    config.split.region_max_size = 2 * 1024 * 1024;
    config.split.chunk_size = 128 * 1024;
    config.split.check_approximate_size = 1;
    config
}

fn open_with_coordinator(
    config: Config,
) -> (TempDir, Arc<RecordingCoordinator>, RegionRegistry) {
    let tmp = TempDir::new().unwrap();
    let coordinator = Arc::new(RecordingCoordinator::default());
    let registry = RegionRegistry::open(
        tmp.path(),
        config,
        Arc::new(LocalTsSource::new()),
        Arc::clone(&coordinator) as Arc<dyn Coordinator>,
    )
    .unwrap();
    (tmp, coordinator, registry)
}

fn fill_region(store: &RegionStore) {
    for chunk_start in (0..KEY_COUNT).step_by(64) {
        let kvs: Vec<KeyValue> = (chunk_start..(chunk_start + 64).min(KEY_COUNT))
            .map(|i| KeyValue::new(format!("key-{i:06}").into_bytes(), vec![0xCD; VALUE_SIZE]))
            .collect();
        store.kv_put(&kvs).unwrap();
    }
}

fn wait_for_check(registry: &RegionRegistry, region_id: RegionId) {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if !registry.split_checker().is_checking(region_id) {
            return;
        }
        assert!(Instant::now() < deadline, "split check did not finish");
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn kv_region(registry: &RegionRegistry, id: RegionId) -> Arc<RegionStore> {
    registry
        .create_region(RegionDescriptor {
            id,
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
fn test_half_policy_dispatches_one_split() {
    let (_tmp, coordinator, registry) = open_with_coordinator(split_config());
    let store = kv_region(&registry, 1);
    fill_region(&store);

    assert!(registry.split_checker().schedule(Arc::clone(&store)));
    // The same region cannot be queued twice while the walk runs.
    assert!(!registry.split_checker().schedule(Arc::clone(&store)));
    wait_for_check(&registry, 1);

    let splits = coordinator.splits.lock();
    assert_eq!(splits.len(), 1, "exactly one SplitRegion call");
    let (region_id, split_key) = &splits[0];
    assert_eq!(*region_id, 1);

    // The split key lies inside the region's range...
    assert!(store.region().check_key_in_range(split_key).is_ok());
    // ...and near the middle of the keyspace.
    let user = &split_key[9..];
    let index: usize = std::str::from_utf8(user)
        .unwrap()
        .trim_start_matches("key-")
        .parse()
        .unwrap();
    assert!(
        (KEY_COUNT / 4..KEY_COUNT * 3 / 4).contains(&index),
        "split at key index {index}"
    );

    // The walk refreshed the region metrics.
    assert!(store.region().approx_size() > (KEY_COUNT * VALUE_SIZE) as u64 / 2);
    assert_eq!(store.region().key_count(), KEY_COUNT as u64);
}

#[test]
fn test_small_region_is_not_split() {
    let mut config = split_config();
    config.split.region_max_size = 1024 * 1024 * 1024;
    let (_tmp, coordinator, registry) = open_with_coordinator(config);
    let store = kv_region(&registry, 2);
    fill_region(&store);

    assert!(registry.split_checker().schedule(Arc::clone(&store)));
    wait_for_check(&registry, 2);
    assert!(coordinator.splits.lock().is_empty(), "below threshold");
}

#[test]
fn test_precheck_skips_ineligible_regions() {
    let (_tmp, coordinator, registry) = open_with_coordinator(split_config());
    let store = kv_region(&registry, 3);
    fill_region(&store);

    // Disabled split flag.
    store.region().set_disable_split(true);
    assert!(!registry.split_checker().schedule(Arc::clone(&store)));
    store.region().set_disable_split(false);

    // Read-only cluster.
    coordinator
        .read_only
        .store(true, std::sync::atomic::Ordering::Release);
    assert!(!registry.split_checker().schedule(Arc::clone(&store)));
    coordinator
        .read_only
        .store(false, std::sync::atomic::Ordering::Release);

    // Now eligible again.
    assert!(registry.split_checker().schedule(Arc::clone(&store)));
    wait_for_check(&registry, 3);
    assert_eq!(coordinator.splits.lock().len(), 1);
}

#[test]
fn test_auto_split_disabled_by_config() {
    let mut config = split_config();
    config.region.enable_auto_split = false;
    let (_tmp, coordinator, registry) = open_with_coordinator(config);
    let store = kv_region(&registry, 4);
    fill_region(&store);

    assert!(!registry.split_checker().schedule(store));
    assert!(coordinator.splits.lock().is_empty());
}

#[test]
fn test_size_policy_end_to_end() {
    let mut config = split_config();
    config.split.policy = SplitPolicy::Size;
    config.split.size_ratio = 0.5;
    let (_tmp, coordinator, registry) = open_with_coordinator(config);
    let store = kv_region(&registry, 5);
    fill_region(&store);

    assert!(registry.split_checker().schedule(Arc::clone(&store)));
    wait_for_check(&registry, 5);

    let splits = coordinator.splits.lock();
    assert_eq!(splits.len(), 1);
    assert!(store.region().check_key_in_range(&splits[0].1).is_ok());
}
