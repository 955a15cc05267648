//! Per-region index holder.
//!
//! Owns the region's in-memory ANN index behind a reader-writer lock:
//! searches take the read lock, add/delete take the write lock briefly, and
//! a rebuild swaps the whole index in one store. Index updates may lag the
//! KV side by one apply cycle; the query engine compensates by reading
//! payloads from the data family.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use rangekv_core::error::{StoreError, StoreResult};
use rangekv_core::types::{RegionId, VectorId};

use crate::index::{AnyVectorIndex, IndexFilter, SearchHit, VectorIndexOps, VectorIndexParams};

/// Lifecycle of a region's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// Not built yet; searches fail with `IndexNotReady`.
    Empty,
    Building,
    Ready,
}

/// Point-in-time status snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexStatus {
    pub state: IndexState,
    pub variant: Option<&'static str>,
    pub count: usize,
    pub deleted_count: usize,
    pub memory_size: usize,
    /// Timestamp of the newest write applied to the index.
    pub apply_ts: i64,
}

/// Snapshot file location for a region's index.
pub fn index_snapshot_path(base_dir: &Path, region_id: RegionId) -> PathBuf {
    base_dir
        .join("vector_index")
        .join(region_id.to_string())
        .join("index.snapshot")
}

pub struct VectorIndexHolder {
    params: VectorIndexParams,
    state: Mutex<IndexState>,
    index: RwLock<Option<AnyVectorIndex>>,
    apply_ts: AtomicI64,
    /// Region epoch version the index was built under; a version change
    /// invalidates the index and forces a rebuild.
    epoch_version: AtomicI64,
}

impl VectorIndexHolder {
    pub fn new(params: VectorIndexParams) -> Self {
        Self {
            params,
            state: Mutex::new(IndexState::Empty),
            index: RwLock::new(None),
            apply_ts: AtomicI64::new(0),
            epoch_version: AtomicI64::new(0),
        }
    }

    pub fn params(&self) -> &VectorIndexParams {
        &self.params
    }

    pub fn state(&self) -> IndexState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == IndexState::Ready
    }

    pub fn apply_ts(&self) -> i64 {
        self.apply_ts.load(Ordering::Acquire)
    }

    /// Mark a build in flight; refuses concurrent builds.
    pub fn begin_build(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        if *state == IndexState::Building {
            return Err(StoreError::Internal(
                "index build already running".to_string(),
            ));
        }
        *state = IndexState::Building;
        Ok(())
    }

    /// Abort a build, restoring the previous readiness.
    pub fn abort_build(&self) {
        let mut state = self.state.lock();
        *state = if self.index.read().is_some() {
            IndexState::Ready
        } else {
            IndexState::Empty
        };
    }

    /// Swap in a freshly built or loaded index.
    pub fn install(&self, index: AnyVectorIndex, apply_ts: i64, epoch_version: i64) {
        info!(
            variant = index.variant_name(),
            count = index.count(),
            apply_ts,
            "vector index installed"
        );
        *self.index.write() = Some(index);
        self.apply_ts.store(apply_ts, Ordering::Release);
        self.epoch_version.store(epoch_version, Ordering::Release);
        *self.state.lock() = IndexState::Ready;
    }

    /// Drop the in-memory index (and optionally its snapshot file).
    pub fn reset(&self, snapshot_path: Option<&Path>) -> StoreResult<()> {
        *self.index.write() = None;
        *self.state.lock() = IndexState::Empty;
        self.apply_ts.store(0, Ordering::Release);
        if let Some(path) = snapshot_path {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// True when the index was built under a different epoch version and
    /// must be rebuilt before serving.
    pub fn needs_rebuild(&self, current_epoch_version: i64) -> bool {
        self.is_ready() && self.epoch_version.load(Ordering::Acquire) != current_epoch_version
    }

    /// Apply writes to the live index. A missing index is not an error: the
    /// records are on the KV side and the next build will pick them up.
    pub fn add(&self, records: &[(VectorId, Vec<f32>)], ts: i64) -> StoreResult<()> {
        let mut guard = self.index.write();
        match guard.as_mut() {
            Some(index) => {
                index.add(records)?;
                self.apply_ts.fetch_max(ts, Ordering::AcqRel);
            }
            None => {
                debug!(count = records.len(), "index not built, add deferred to next build");
            }
        }
        Ok(())
    }

    pub fn delete(&self, ids: &[VectorId], ts: i64) -> StoreResult<usize> {
        let mut guard = self.index.write();
        match guard.as_mut() {
            Some(index) => {
                let removed = index.delete(ids);
                self.apply_ts.fetch_max(ts, Ordering::AcqRel);
                Ok(removed)
            }
            None => Ok(0),
        }
    }

    pub fn search(
        &self,
        queries: &[Vec<f32>],
        topk: usize,
        filter: Option<&IndexFilter>,
    ) -> StoreResult<Vec<Vec<SearchHit>>> {
        let guard = self.index.read();
        let index = guard.as_ref().ok_or(StoreError::IndexNotReady)?;
        index.search(queries, topk, filter)
    }

    pub fn range_search(
        &self,
        queries: &[Vec<f32>],
        radius: f32,
        filter: Option<&IndexFilter>,
        max_results: usize,
    ) -> StoreResult<Vec<Vec<SearchHit>>> {
        let guard = self.index.read();
        let index = guard.as_ref().ok_or(StoreError::IndexNotReady)?;
        index.range_search(queries, radius, filter, max_results)
    }

    pub fn status(&self) -> IndexStatus {
        let guard = self.index.read();
        match guard.as_ref() {
            Some(index) => IndexStatus {
                state: self.state(),
                variant: Some(index.variant_name()),
                count: index.count(),
                deleted_count: index.deleted_count(),
                memory_size: index.memory_size(),
                apply_ts: self.apply_ts(),
            },
            None => IndexStatus {
                state: self.state(),
                variant: None,
                count: 0,
                deleted_count: 0,
                memory_size: 0,
                apply_ts: 0,
            },
        }
    }

    /// Persist the live index to a snapshot file.
    pub fn save(&self, path: &Path) -> StoreResult<()> {
        let guard = self.index.read();
        let index = guard.as_ref().ok_or(StoreError::IndexNotReady)?;
        index.save(path)
    }

    /// Load a snapshot, replacing the live index.
    pub fn load(&self, path: &Path, epoch_version: i64) -> StoreResult<()> {
        let index = AnyVectorIndex::load(path)?;
        if index.dimension() != self.params.dimension() {
            return Err(StoreError::DimensionMismatch {
                expected: self.params.dimension(),
                actual: index.dimension(),
            });
        }
        let apply_ts = self.apply_ts();
        self.install(index, apply_ts, epoch_version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::Metric;

    fn holder() -> VectorIndexHolder {
        VectorIndexHolder::new(VectorIndexParams::Flat {
            dimension: 4,
            metric: Metric::L2,
        })
    }

    #[test]
    fn test_search_before_build_fails() {
        let holder = holder();
        assert!(matches!(
            holder.search(&[vec![0.0; 4]], 1, None),
            Err(StoreError::IndexNotReady)
        ));
        assert_eq!(holder.state(), IndexState::Empty);
    }

    #[test]
    fn test_add_before_build_is_deferred() {
        let holder = holder();
        holder.add(&[(1, vec![1.0, 0.0, 0.0, 0.0])], 10).unwrap();
        assert_eq!(holder.apply_ts(), 0, "nothing applied without an index");
    }

    #[test]
    fn test_build_install_and_serve() {
        let holder = holder();
        holder.begin_build().unwrap();
        assert!(holder.begin_build().is_err(), "concurrent builds refused");

        let mut index = holder.params().build_empty();
        index.add(&[(1, vec![1.0, 0.0, 0.0, 0.0])]).unwrap();
        holder.install(index, 100, 1);

        assert!(holder.is_ready());
        let hits = holder.search(&[vec![1.0, 0.0, 0.0, 0.0]], 1, None).unwrap();
        assert_eq!(hits[0][0].id, 1);

        holder.add(&[(2, vec![0.0, 1.0, 0.0, 0.0])], 120).unwrap();
        assert_eq!(holder.apply_ts(), 120);
        assert_eq!(holder.delete(&[1], 130).unwrap(), 1);
        assert_eq!(holder.status().count, 1);
    }

    #[test]
    fn test_epoch_change_forces_rebuild() {
        let holder = holder();
        holder.begin_build().unwrap();
        holder.install(holder.params().build_empty(), 10, 3);
        assert!(!holder.needs_rebuild(3));
        assert!(holder.needs_rebuild(4));
    }

    #[test]
    fn test_reset_clears_state() {
        let holder = holder();
        holder.begin_build().unwrap();
        holder.install(holder.params().build_empty(), 10, 1);
        holder.reset(None).unwrap();
        assert_eq!(holder.state(), IndexState::Empty);
        assert!(matches!(
            holder.search(&[vec![0.0; 4]], 1, None),
            Err(StoreError::IndexNotReady)
        ));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let holder = holder();
        holder.begin_build().unwrap();
        let mut index = holder.params().build_empty();
        index.add(&[(1, vec![1.0, 0.0, 0.0, 0.0])]).unwrap();
        holder.install(index, 10, 1);

        let tmp = tempfile::TempDir::new().unwrap();
        let path = index_snapshot_path(tmp.path(), 42);
        holder.save(&path).unwrap();

        let fresh = self::holder();
        fresh.load(&path, 1).unwrap();
        assert!(fresh.is_ready());
        assert_eq!(fresh.status().count, 1);
    }
}
