//! Background split checking.
//!
//! A small worker pool walks candidate regions through the merged-iterator
//! policies and dispatches at most one `SplitRegion` RPC per positive check.
//! A per-region exclusion set prevents two concurrent walks of the same
//! region; negative results are logged and dropped. The walk never blocks
//! foreground traffic: it runs on an engine snapshot and checks its cancel
//! token at every heap pop.

use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{info, warn};

use rangekv_core::codec;
use rangekv_core::config::{RegionConfig, SplitConfig};
use rangekv_core::coordinator::Coordinator;
use rangekv_core::error::StoreResult;
use rangekv_core::types::{OpContext, RegionId, RegionState, RegionType};
use rangekv_storage::cf_names;
use rangekv_storage::split::SplitKeyPicker;
use rangekv_vector::IndexState;

use crate::store::RegionStore;

struct SplitCheckTask {
    store: Arc<RegionStore>,
}

/// State shared between the scheduling surface and the workers. The workers
/// hold only this inner handle, so dropping the runner closes the channel
/// and lets them exit.
struct Shared {
    split_config: SplitConfig,
    region_config: RegionConfig,
    coordinator: Arc<dyn Coordinator>,
    checking: Mutex<HashSet<RegionId>>,
}

impl Shared {
    fn precheck_reason(&self, store: &RegionStore) -> Option<&'static str> {
        let region = store.region();
        if !self.region_config.enable_auto_split {
            return Some("auto split disabled");
        }
        if self.coordinator.cluster_read_only() {
            return Some("cluster is read-only");
        }
        if region.state() != RegionState::Normal {
            return Some("region state not normal");
        }
        if region.split_disabled() {
            return Some("region disables split");
        }
        if region.approx_size() > 0
            && region.approx_size() < self.split_config.check_approximate_size
        {
            return Some("approximate size below check floor");
        }
        if store
            .index_holder()
            .map(|holder| holder.state() == IndexState::Building)
            .unwrap_or(false)
        {
            return Some("vector index build running");
        }
        None
    }

    fn run_check(&self, store: &Arc<RegionStore>) -> StoreResult<()> {
        let region = store.region();
        let epoch_before = region.epoch();
        let plain_range = region.range();

        let cf_set: &[&str] = match (region.region_type(), region.prefix()) {
            (RegionType::VectorIndex, _) => cf_names::VECTOR_REGION,
            (_, codec::TXN_PREFIX) => cf_names::TXN_REGION,
            _ => cf_names::RAW_REGION,
        };

        let picker = SplitKeyPicker::from_config(&self.split_config);
        let op = OpContext::none();
        let scan = {
            let snapshot = store.raw_store().snapshot();
            picker.pick(&snapshot, cf_set, &plain_range, &op)?
        };

        region.update_metrics(scan.size, scan.keys);

        let plain_split_key = match &scan.split_key {
            Some(encoded) => codec::strip_ts(encoded)?.to_vec(),
            None => Vec::new(),
        };

        // Post-validation: the walk takes time and the region may have moved
        // under it.
        let reason = if plain_split_key.is_empty() {
            Some("split key is empty")
        } else if region.epoch().version != epoch_before.version {
            Some("region version changed")
        } else if region.check_key_in_range(&plain_split_key).is_err() {
            Some("split key not in region range")
        } else if region.state() != RegionState::Normal {
            Some("region state not normal")
        } else if region.split_disabled() {
            Some("region disables split")
        } else if store
            .index_holder()
            .map(|holder| holder.state() == IndexState::Building)
            .unwrap_or(false)
        {
            Some("vector index build running")
        } else if self.coordinator.cluster_read_only() {
            Some("cluster is read-only")
        } else {
            None
        };

        info!(
            region = region.id(),
            policy = picker.policy_name(),
            size = scan.size,
            keys = scan.keys,
            need_split = reason.is_none(),
            reason = reason.unwrap_or("-"),
            "split check finished"
        );
        if reason.is_some() {
            return Ok(());
        }

        // One RPC per positive check; the coordinator dedupes repeats.
        if let Err(err) = self
            .coordinator
            .split_region(region.id(), &plain_split_key)
        {
            warn!(region = region.id(), error = %err, "split region rpc failed");
        }
        Ok(())
    }
}

pub struct SplitCheckRunner {
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::Sender<SplitCheckTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SplitCheckRunner {
    pub fn new(
        split_config: SplitConfig,
        region_config: RegionConfig,
        coordinator: Arc<dyn Coordinator>,
    ) -> Self {
        let worker_num = split_config.worker_num;
        let shared = Arc::new(Shared {
            split_config,
            region_config,
            coordinator,
            checking: Mutex::new(HashSet::new()),
        });

        let (sender, receiver) = mpsc::channel::<SplitCheckTask>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(worker_num);
        for worker_id in 0..worker_num {
            let receiver = Arc::clone(&receiver);
            let shared = Arc::clone(&shared);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("split-check-{worker_id}"))
                    .spawn(move || loop {
                        let task = {
                            let guard = receiver.lock();
                            guard.recv()
                        };
                        let Ok(task) = task else {
                            return;
                        };
                        let region_id = task.store.region().id();
                        if let Err(err) = shared.run_check(&task.store) {
                            warn!(region = region_id, error = %err, "split check failed");
                        }
                        shared.checking.lock().remove(&region_id);
                    })
                    .expect("spawn split check worker"),
            );
        }

        Self {
            shared,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Queue a region for a split check. Returns false when the pre-check
    /// decided against walking it.
    pub fn schedule(&self, store: Arc<RegionStore>) -> bool {
        let region_id = store.region().id();

        if let Some(reason) = self.shared.precheck_reason(&store) {
            info!(region = region_id, reason, "presplit check skipped");
            return false;
        }

        {
            let mut checking = self.shared.checking.lock();
            if !checking.insert(region_id) {
                info!(region = region_id, "split check already running");
                return false;
            }
        }

        let sent = self
            .sender
            .lock()
            .as_ref()
            .map(|sender| sender.send(SplitCheckTask { store }).is_ok())
            .unwrap_or(false);
        if !sent {
            self.shared.checking.lock().remove(&region_id);
        }
        sent
    }

    pub fn is_checking(&self, region_id: RegionId) -> bool {
        self.shared.checking.lock().contains(&region_id)
    }

    pub fn shutdown(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for SplitCheckRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
