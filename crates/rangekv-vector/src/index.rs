//! Index variants, capability trait and id filters.
//!
//! Index polymorphism is a tagged variant rather than trait objects: the set
//! of index kinds is closed and variant dispatch keeps serialization and
//! snapshot round-trips trivial.

use std::path::Path;

use serde::{Deserialize, Serialize};

use rangekv_core::error::{StoreError, StoreResult};
use rangekv_core::types::VectorId;

use crate::distance::Metric;
use crate::flat::FlatIndex;
use crate::hnsw::{HnswIndex, HnswParams};

/// One search result: vector id and internal score (smaller is better).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub id: VectorId,
    pub score: f32,
}

impl SearchHit {
    /// Canonical result order: score ascending, id ascending on ties.
    pub fn sort(hits: &mut [SearchHit]) {
        hits.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
    }
}

/// Filter algebra evaluated against vector ids during index traversal.
#[derive(Debug, Clone)]
pub enum IndexFilter {
    /// Membership in a sorted id list, optionally negated.
    IdAllow { ids: Vec<VectorId>, negate: bool },
    /// Explicit exclusion list.
    IdDeny { ids: Vec<VectorId> },
    And(Box<IndexFilter>, Box<IndexFilter>),
}

impl IndexFilter {
    /// Build an allow filter; sorts and deduplicates unless the caller
    /// vouches for the order.
    pub fn id_allow(mut ids: Vec<VectorId>, negate: bool, sorted: bool) -> Self {
        if !sorted {
            ids.sort_unstable();
            ids.dedup();
        }
        IndexFilter::IdAllow { ids, negate }
    }

    pub fn id_deny(mut ids: Vec<VectorId>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        IndexFilter::IdDeny { ids }
    }

    pub fn and(self, other: IndexFilter) -> Self {
        IndexFilter::And(Box::new(self), Box::new(other))
    }

    pub fn matches(&self, id: VectorId) -> bool {
        match self {
            IndexFilter::IdAllow { ids, negate } => ids.binary_search(&id).is_ok() != *negate,
            IndexFilter::IdDeny { ids } => ids.binary_search(&id).is_err(),
            IndexFilter::And(a, b) => a.matches(id) && b.matches(id),
        }
    }
}

/// Capability surface common to every index variant.
pub trait VectorIndexOps {
    /// Insert or overwrite records. Re-adding an existing id replaces it.
    fn add(&mut self, records: &[(VectorId, Vec<f32>)]) -> StoreResult<()>;

    /// Logically delete ids; returns how many were present.
    fn delete(&mut self, ids: &[VectorId]) -> usize;

    /// Top-k per query, canonically ordered.
    fn search(
        &self,
        queries: &[Vec<f32>],
        topk: usize,
        filter: Option<&IndexFilter>,
    ) -> StoreResult<Vec<Vec<SearchHit>>>;

    /// All hits within `radius` per query, capped at `max_results`.
    fn range_search(
        &self,
        queries: &[Vec<f32>],
        radius: f32,
        filter: Option<&IndexFilter>,
        max_results: usize,
    ) -> StoreResult<Vec<Vec<SearchHit>>>;

    fn count(&self) -> usize;
    fn deleted_count(&self) -> usize;
    fn memory_size(&self) -> usize;
    fn dimension(&self) -> usize;
    fn metric(&self) -> Metric;
}

/// Construction parameters for a region's index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorIndexParams {
    Flat {
        dimension: usize,
        metric: Metric,
    },
    Hnsw {
        dimension: usize,
        metric: Metric,
        params: HnswParams,
    },
}

impl VectorIndexParams {
    pub fn dimension(&self) -> usize {
        match self {
            VectorIndexParams::Flat { dimension, .. } => *dimension,
            VectorIndexParams::Hnsw { dimension, .. } => *dimension,
        }
    }

    pub fn metric(&self) -> Metric {
        match self {
            VectorIndexParams::Flat { metric, .. } => *metric,
            VectorIndexParams::Hnsw { metric, .. } => *metric,
        }
    }

    pub fn build_empty(&self) -> AnyVectorIndex {
        match self {
            VectorIndexParams::Flat { dimension, metric } => {
                AnyVectorIndex::Flat(FlatIndex::new(*dimension, *metric))
            }
            VectorIndexParams::Hnsw {
                dimension,
                metric,
                params,
            } => AnyVectorIndex::Hnsw(HnswIndex::new(*dimension, *metric, params.clone())),
        }
    }
}

/// The closed set of index implementations.
#[derive(Debug, Serialize, Deserialize)]
pub enum AnyVectorIndex {
    Flat(FlatIndex),
    Hnsw(HnswIndex),
}

macro_rules! dispatch {
    ($self:expr, $index:ident => $body:expr) => {
        match $self {
            AnyVectorIndex::Flat($index) => $body,
            AnyVectorIndex::Hnsw($index) => $body,
        }
    };
}

impl AnyVectorIndex {
    pub fn variant_name(&self) -> &'static str {
        match self {
            AnyVectorIndex::Flat(_) => "flat",
            AnyVectorIndex::Hnsw(_) => "hnsw",
        }
    }

    /// Persist the index as an opaque snapshot file.
    pub fn save(&self, path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = bincode::serialize(self)
            .map_err(|e| StoreError::Internal(format!("index snapshot encode: {e}")))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Load a snapshot produced by [`AnyVectorIndex::save`].
    pub fn load(path: &Path) -> StoreResult<Self> {
        let bytes = std::fs::read(path)?;
        bincode::deserialize(&bytes).map_err(|e| StoreError::Corruption {
            location: format!("index snapshot {}", path.display()),
            details: e.to_string(),
        })
    }
}

impl VectorIndexOps for AnyVectorIndex {
    fn add(&mut self, records: &[(VectorId, Vec<f32>)]) -> StoreResult<()> {
        dispatch!(self, index => index.add(records))
    }

    fn delete(&mut self, ids: &[VectorId]) -> usize {
        dispatch!(self, index => index.delete(ids))
    }

    fn search(
        &self,
        queries: &[Vec<f32>],
        topk: usize,
        filter: Option<&IndexFilter>,
    ) -> StoreResult<Vec<Vec<SearchHit>>> {
        dispatch!(self, index => index.search(queries, topk, filter))
    }

    fn range_search(
        &self,
        queries: &[Vec<f32>],
        radius: f32,
        filter: Option<&IndexFilter>,
        max_results: usize,
    ) -> StoreResult<Vec<Vec<SearchHit>>> {
        dispatch!(self, index => index.range_search(queries, radius, filter, max_results))
    }

    fn count(&self) -> usize {
        dispatch!(self, index => index.count())
    }

    fn deleted_count(&self) -> usize {
        dispatch!(self, index => index.deleted_count())
    }

    fn memory_size(&self) -> usize {
        dispatch!(self, index => index.memory_size())
    }

    fn dimension(&self) -> usize {
        dispatch!(self, index => index.dimension())
    }

    fn metric(&self) -> Metric {
        dispatch!(self, index => index.metric())
    }
}
