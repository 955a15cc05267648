//! Process-wide region registry.
//!
//! Owns the engine handle, the timestamp provider and the strong handle to
//! every region store. Destroying a region removes the registry entry and
//! drains: the store is only torn down once every in-flight operation has
//! dropped its clone of the handle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::info;

use rangekv_core::config::Config;
use rangekv_core::coordinator::Coordinator;
use rangekv_core::error::{StoreError, StoreResult};
use rangekv_core::ts::{TsProvider, TsSource};
use rangekv_core::types::{RegionId, RegionState, RegionType, ScalarSchema};
use rangekv_storage::RawStore;
use rangekv_vector::VectorIndexParams;

use crate::region::Region;
use crate::split_worker::SplitCheckRunner;
use crate::store::RegionStore;

/// How a new region should be shaped.
#[derive(Debug, Clone)]
pub struct RegionDescriptor {
    pub id: RegionId,
    pub region_type: RegionType,
    pub partition_id: i64,
    pub txn_enabled: bool,
    pub user_start: Vec<u8>,
    pub user_end: Vec<u8>,
    pub schema: ScalarSchema,
    pub index_params: Option<VectorIndexParams>,
}

pub struct RegionRegistry {
    raw: Arc<RawStore>,
    ts: Arc<TsProvider>,
    config: Config,
    base_dir: PathBuf,
    split_checker: Arc<SplitCheckRunner>,
    regions: RwLock<HashMap<RegionId, Arc<RegionStore>>>,
}

impl RegionRegistry {
    /// Open the engine under `base_dir/db` and start the background
    /// machinery.
    pub fn open(
        base_dir: impl Into<PathBuf>,
        config: Config,
        ts_source: Arc<dyn TsSource>,
        coordinator: Arc<dyn Coordinator>,
    ) -> StoreResult<Self> {
        config.validate()?;
        let base_dir = base_dir.into();
        let raw = Arc::new(RawStore::open(base_dir.join("db"), &config.raw)?);
        let ts = Arc::new(TsProvider::new(ts_source, config.ts_provider.clone()));
        let split_checker = Arc::new(SplitCheckRunner::new(
            config.split.clone(),
            config.region.clone(),
            coordinator,
        ));
        Ok(Self {
            raw,
            ts,
            config,
            base_dir,
            split_checker,
            regions: RwLock::new(HashMap::new()),
        })
    }

    pub fn ts_provider(&self) -> &Arc<TsProvider> {
        &self.ts
    }

    pub fn raw_store(&self) -> &Arc<RawStore> {
        &self.raw
    }

    pub fn split_checker(&self) -> &Arc<SplitCheckRunner> {
        &self.split_checker
    }

    pub fn create_region(&self, descriptor: RegionDescriptor) -> StoreResult<Arc<RegionStore>> {
        let mut regions = self.regions.write();
        if regions.contains_key(&descriptor.id) {
            return Err(StoreError::Internal(format!(
                "region {} already exists",
                descriptor.id
            )));
        }
        let region = Arc::new(Region::new(
            descriptor.id,
            descriptor.region_type,
            descriptor.partition_id,
            descriptor.txn_enabled,
            &descriptor.user_start,
            &descriptor.user_end,
        ));
        let store = Arc::new(RegionStore::new(
            region,
            Arc::clone(&self.raw),
            Arc::clone(&self.ts),
            self.config.clone(),
            self.base_dir.clone(),
            descriptor.schema,
            descriptor.index_params,
        ));
        regions.insert(descriptor.id, Arc::clone(&store));
        info!(region = descriptor.id, "region created");
        Ok(store)
    }

    pub fn get(&self, region_id: RegionId) -> StoreResult<Arc<RegionStore>> {
        self.regions
            .read()
            .get(&region_id)
            .cloned()
            .ok_or(StoreError::RegionNotFound(region_id))
    }

    pub fn list(&self) -> Vec<Arc<RegionStore>> {
        self.regions.read().values().cloned().collect()
    }

    /// Remove a region and wait for in-flight operations to drain.
    pub fn drop_region(&self, region_id: RegionId, drain_timeout: Duration) -> StoreResult<()> {
        let store = {
            let mut regions = self.regions.write();
            regions
                .remove(&region_id)
                .ok_or(StoreError::RegionNotFound(region_id))?
        };
        store.region().set_state(RegionState::Deleting);

        let deadline = Instant::now() + drain_timeout;
        while Arc::strong_count(&store) > 1 {
            if Instant::now() >= deadline {
                return Err(StoreError::Internal(format!(
                    "region {region_id} did not drain in time"
                )));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        info!(region = region_id, "region destroyed");
        Ok(())
    }

    /// Run the presplit pass over every region (the periodic trigger).
    pub fn trigger_split_checks(&self) {
        for store in self.list() {
            self.split_checker.schedule(store);
        }
    }
}
