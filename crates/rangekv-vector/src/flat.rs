//! Brute-force index: exact distances over a contiguous vector arena.
//!
//! The reference implementation for every other index variant, the fallback
//! when a variant cannot honor a request, and the workhorse of brute-force
//! query mode. Queries fan out across a rayon pool; each query keeps a
//! bounded max-heap so memory stays at O(topk).

use std::collections::{BinaryHeap, HashMap};

use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use rangekv_core::error::{StoreError, StoreResult};
use rangekv_core::types::VectorId;

use crate::distance::Metric;
use crate::index::{IndexFilter, SearchHit, VectorIndexOps};

/// Max-heap entry so the worst kept hit is on top.
type HeapHit = (OrderedFloat<f32>, VectorId);

#[derive(Debug, Serialize, Deserialize)]
pub struct FlatIndex {
    metric: Metric,
    dimension: usize,
    ids: Vec<VectorId>,
    id_pos: HashMap<VectorId, u32>,
    /// Row-major vector arena, one row per id (normalized under cosine).
    data: Vec<f32>,
    deleted: Vec<bool>,
    deleted_count: usize,
}

impl FlatIndex {
    pub fn new(dimension: usize, metric: Metric) -> Self {
        Self {
            metric,
            dimension,
            ids: Vec::new(),
            id_pos: HashMap::new(),
            data: Vec::new(),
            deleted: Vec::new(),
            deleted_count: 0,
        }
    }

    fn row(&self, pos: u32) -> &[f32] {
        let start = pos as usize * self.dimension;
        &self.data[start..start + self.dimension]
    }

    fn check_dimension(&self, vector: &[f32]) -> StoreResult<()> {
        if vector.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn search_one(
        &self,
        query: &[f32],
        topk: usize,
        filter: Option<&IndexFilter>,
    ) -> Vec<SearchHit> {
        let mut heap: BinaryHeap<HeapHit> = BinaryHeap::with_capacity(topk + 1);
        for (pos, &id) in self.ids.iter().enumerate() {
            if self.deleted[pos] {
                continue;
            }
            if let Some(filter) = filter {
                if !filter.matches(id) {
                    continue;
                }
            }
            let score = self.metric.score(query, self.row(pos as u32));
            if heap.len() < topk {
                heap.push((OrderedFloat(score), id));
            } else if let Some(&(worst, worst_id)) = heap.peek() {
                if OrderedFloat(score) < worst
                    || (OrderedFloat(score) == worst && id < worst_id)
                {
                    heap.pop();
                    heap.push((OrderedFloat(score), id));
                }
            }
        }
        let mut hits: Vec<SearchHit> = heap
            .into_iter()
            .map(|(score, id)| SearchHit { id, score: score.0 })
            .collect();
        SearchHit::sort(&mut hits);
        hits
    }

    fn range_search_one(
        &self,
        query: &[f32],
        radius: f32,
        filter: Option<&IndexFilter>,
        max_results: usize,
    ) -> Vec<SearchHit> {
        let bound = self.metric.score_bound(radius);
        let mut hits = Vec::new();
        for (pos, &id) in self.ids.iter().enumerate() {
            if self.deleted[pos] {
                continue;
            }
            if let Some(filter) = filter {
                if !filter.matches(id) {
                    continue;
                }
            }
            let score = self.metric.score(query, self.row(pos as u32));
            if score <= bound {
                hits.push(SearchHit { id, score });
            }
        }
        SearchHit::sort(&mut hits);
        if hits.len() > max_results {
            tracing::warn!(
                limit = max_results,
                actual = hits.len(),
                "range search result count exceeds limit, truncating"
            );
            hits.truncate(max_results);
        }
        hits
    }
}

impl VectorIndexOps for FlatIndex {
    fn add(&mut self, records: &[(VectorId, Vec<f32>)]) -> StoreResult<()> {
        for (_, vector) in records {
            self.check_dimension(vector)?;
        }
        for (id, vector) in records {
            let prepared = self.metric.prepare(vector);
            match self.id_pos.get(id) {
                Some(&pos) => {
                    // Overwrite in place; revive if it was tombstoned.
                    let start = pos as usize * self.dimension;
                    self.data[start..start + self.dimension].copy_from_slice(&prepared);
                    if std::mem::replace(&mut self.deleted[pos as usize], false) {
                        self.deleted_count -= 1;
                    }
                }
                None => {
                    let pos = self.ids.len() as u32;
                    self.ids.push(*id);
                    self.deleted.push(false);
                    self.data.extend_from_slice(&prepared);
                    self.id_pos.insert(*id, pos);
                }
            }
        }
        Ok(())
    }

    fn delete(&mut self, ids: &[VectorId]) -> usize {
        let mut removed = 0;
        for id in ids {
            if let Some(&pos) = self.id_pos.get(id) {
                if !std::mem::replace(&mut self.deleted[pos as usize], true) {
                    self.deleted_count += 1;
                    removed += 1;
                }
            }
        }
        removed
    }

    fn search(
        &self,
        queries: &[Vec<f32>],
        topk: usize,
        filter: Option<&IndexFilter>,
    ) -> StoreResult<Vec<Vec<SearchHit>>> {
        if topk == 0 || queries.is_empty() {
            return Ok(vec![Vec::new(); queries.len()]);
        }
        for query in queries {
            self.check_dimension(query)?;
        }
        let prepared: Vec<Vec<f32>> = queries.iter().map(|q| self.metric.prepare(q)).collect();
        Ok(prepared
            .par_iter()
            .map(|query| self.search_one(query, topk, filter))
            .collect())
    }

    fn range_search(
        &self,
        queries: &[Vec<f32>],
        radius: f32,
        filter: Option<&IndexFilter>,
        max_results: usize,
    ) -> StoreResult<Vec<Vec<SearchHit>>> {
        for query in queries {
            self.check_dimension(query)?;
        }
        let prepared: Vec<Vec<f32>> = queries.iter().map(|q| self.metric.prepare(q)).collect();
        Ok(prepared
            .par_iter()
            .map(|query| self.range_search_one(query, radius, filter, max_results))
            .collect())
    }

    fn count(&self) -> usize {
        self.ids.len() - self.deleted_count
    }

    fn deleted_count(&self) -> usize {
        self.deleted_count
    }

    fn memory_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
            + self.ids.len() * (std::mem::size_of::<VectorId>() + 1)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn metric(&self) -> Metric {
        self.metric
    }
}
