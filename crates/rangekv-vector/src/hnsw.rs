//! Hierarchical navigable small world index.
//!
//! Graph layout follows the usual HNSW construction: an exponential layer
//! draw per node, greedy descent through the upper layers, and a bounded
//! candidate search with heuristic neighbor pruning at insert time. Deletes
//! are logical; tombstoned nodes still serve as navigation waypoints but are
//! filtered from results, so searches never block on deletes.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use rangekv_core::error::{StoreError, StoreResult};
use rangekv_core::types::VectorId;

use crate::distance::Metric;
use crate::index::{IndexFilter, SearchHit, VectorIndexOps};

/// Tuning parameters. `m` controls graph degree (memory), `ef_construction`
/// build quality, `ef_search` the recall/latency trade-off at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    pub m: usize,
    pub m_max0: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub max_layers: usize,
    pub max_elements: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            m_max0: 32,
            ef_construction: 200,
            ef_search: 64,
            max_layers: 16,
            max_elements: 1 << 20,
        }
    }
}

/// Generation-stamped visited set; clearing is a counter bump.
#[derive(Debug, Default)]
struct VisitedSet {
    marks: Vec<u32>,
    generation: u32,
}

impl VisitedSet {
    fn new(capacity: usize) -> Self {
        Self {
            marks: vec![0; capacity],
            generation: 1,
        }
    }

    /// Returns true when the node was not yet visited this generation.
    fn insert(&mut self, node: u32) -> bool {
        let slot = &mut self.marks[node as usize];
        if *slot == self.generation {
            false
        } else {
            *slot = self.generation;
            true
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HnswIndex {
    params: HnswParams,
    metric: Metric,
    dimension: usize,
    ids: Vec<VectorId>,
    id_pos: HashMap<VectorId, u32>,
    /// Row-major arena (normalized under cosine).
    vectors: Vec<f32>,
    /// `neighbors[node][layer]` holds the adjacency of `node` at `layer`.
    neighbors: Vec<Vec<Vec<u32>>>,
    layers: Vec<u8>,
    deleted: Vec<bool>,
    deleted_count: usize,
    entry_point: Option<u32>,
    max_layer: usize,
}

impl HnswIndex {
    pub fn new(dimension: usize, metric: Metric, params: HnswParams) -> Self {
        Self {
            params,
            metric,
            dimension,
            ids: Vec::new(),
            id_pos: HashMap::new(),
            vectors: Vec::new(),
            neighbors: Vec::new(),
            layers: Vec::new(),
            deleted: Vec::new(),
            deleted_count: 0,
            entry_point: None,
            max_layer: 0,
        }
    }

    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    fn row(&self, node: u32) -> &[f32] {
        let start = node as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    fn score_to(&self, query: &[f32], node: u32) -> f32 {
        self.metric.score(query, self.row(node))
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

    fn random_level(&self) -> usize {
        let ml = 1.0 / (self.params.m as f64).ln();
        let r: f64 = rand::random::<f64>().max(f64::MIN_POSITIVE);
        let level = (-r.ln() * ml).floor() as usize;
        level.min(self.params.max_layers - 1)
    }

    /// Bounded best-first search of one layer. Returns up to `ef` nodes
    /// passing `keep`, ascending by score. Tombstoned and filtered nodes are
    /// traversed but not returned.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[u32],
        ef: usize,
        layer: usize,
        visited: &mut VisitedSet,
        keep: &dyn Fn(u32) -> bool,
    ) -> Vec<(f32, u32)> {
        let mut candidates: BinaryHeap<Reverse<(OrderedFloat<f32>, u32)>> = BinaryHeap::new();
        let mut results: BinaryHeap<(OrderedFloat<f32>, u32)> = BinaryHeap::new();

        for &ep in entry_points {
            if !visited.insert(ep) {
                continue;
            }
            let score = self.score_to(query, ep);
            candidates.push(Reverse((OrderedFloat(score), ep)));
            if !self.deleted[ep as usize] && keep(ep) {
                results.push((OrderedFloat(score), ep));
            }
        }

        while let Some(Reverse((OrderedFloat(score), node))) = candidates.pop() {
            if results.len() >= ef {
                if let Some(&(OrderedFloat(worst), _)) = results.peek() {
                    if score > worst {
                        break;
                    }
                }
            }
            let node_layers = &self.neighbors[node as usize];
            if layer >= node_layers.len() {
                continue;
            }
            for &next in &node_layers[layer] {
                if !visited.insert(next) {
                    continue;
                }
                let next_score = self.score_to(query, next);
                let admit = results.len() < ef
                    || results
                        .peek()
                        .map(|&(OrderedFloat(worst), _)| next_score < worst)
                        .unwrap_or(true);
                if admit {
                    candidates.push(Reverse((OrderedFloat(next_score), next)));
                    if !self.deleted[next as usize] && keep(next) {
                        results.push((OrderedFloat(next_score), next));
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<(f32, u32)> = results
            .into_iter()
            .map(|(OrderedFloat(score), node)| (score, node))
            .collect();
        out.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    /// Heuristic neighbor selection: keep a candidate only when it is closer
    /// to the new node than to every already-selected neighbor, which keeps
    /// edges spread across directions instead of clustering.
    fn select_neighbors(&self, candidates: &[(f32, u32)], m: usize) -> Vec<u32> {
        let mut selected: Vec<u32> = Vec::with_capacity(m);
        for &(score, candidate) in candidates {
            if selected.len() >= m {
                break;
            }
            let occluded = selected.iter().any(|&s| {
                self.metric.score(self.row(candidate), self.row(s)) < score
            });
            if !occluded {
                selected.push(candidate);
            }
        }
        // Backfill with the nearest skipped candidates if pruning was too
        // aggressive.
        if selected.len() < m {
            for &(_, candidate) in candidates {
                if selected.len() >= m {
                    break;
                }
                if !selected.contains(&candidate) {
                    selected.push(candidate);
                }
            }
        }
        selected
    }

    fn link(&mut self, from: u32, to: u32, layer: usize) {
        let max_links = if layer == 0 {
            self.params.m_max0
        } else {
            self.params.m
        };
        let list = &mut self.neighbors[from as usize][layer];
        if !list.contains(&to) {
            list.push(to);
        }
        if list.len() > max_links {
            // Re-prune with the heuristic against the node's own vector.
            let own = from;
            let mut scored: Vec<(f32, u32)> = self.neighbors[own as usize][layer]
                .iter()
                .map(|&n| (self.metric.score(self.row(own), self.row(n)), n))
                .collect();
            scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            let pruned = self.select_neighbors(&scored, max_links);
            self.neighbors[own as usize][layer] = pruned;
        }
    }

    fn insert_node(&mut self, id: VectorId, prepared: Vec<f32>) -> StoreResult<()> {
        if self.ids.len() >= self.params.max_elements {
            return Err(StoreError::OutOfMemory(format!(
                "hnsw index is full ({} elements)",
                self.params.max_elements
            )));
        }

        let node = self.ids.len() as u32;
        let level = self.random_level();
        self.ids.push(id);
        self.vectors.extend_from_slice(&prepared);
        self.layers.push(level as u8);
        self.deleted.push(false);
        self.neighbors.push(vec![Vec::new(); level + 1]);
        self.id_pos.insert(id, node);

        let Some(mut current) = self.entry_point else {
            self.entry_point = Some(node);
            self.max_layer = level;
            return Ok(());
        };

        let query = self.row(node).to_vec();
        let mut visited = VisitedSet::new(self.ids.len());

        // Greedy descent through layers above the node's level.
        for layer in ((level + 1)..=self.max_layer).rev() {
            let found = self.search_layer(&query, &[current], 1, layer, &mut visited, &|_| true);
            if let Some(&(_, nearest)) = found.first() {
                current = nearest;
            }
        }

        // Connect on every layer the node participates in.
        for layer in (0..=level.min(self.max_layer)).rev() {
            let candidates = self.search_layer(
                &query,
                &[current],
                self.params.ef_construction,
                layer,
                &mut visited,
                &|_| true,
            );
            if candidates.is_empty() {
                continue;
            }
            let m = if layer == 0 {
                self.params.m_max0
            } else {
                self.params.m
            };
            let selected = self.select_neighbors(&candidates, m);
            for &neighbor in &selected {
                self.link(node, neighbor, layer);
                self.link(neighbor, node, layer);
            }
            current = candidates[0].1;
        }

        if level > self.max_layer {
            self.max_layer = level;
            self.entry_point = Some(node);
        }
        Ok(())
    }
}

impl VectorIndexOps for HnswIndex {
    fn add(&mut self, records: &[(VectorId, Vec<f32>)]) -> StoreResult<()> {
        for (_, vector) in records {
            self.check_dimension(vector)?;
        }
        for (id, vector) in records {
            // Overwrite is tombstone-then-reinsert; the graph keeps the old
            // node as a waypoint.
            if let Some(&old) = self.id_pos.get(id) {
                if !std::mem::replace(&mut self.deleted[old as usize], true) {
                    self.deleted_count += 1;
                }
            }
            let prepared = self.metric.prepare(vector);
            self.insert_node(*id, prepared)?;
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
        for query in queries {
            self.check_dimension(query)?;
        }
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            results.push(self.search_one(query, topk, filter, self.params.ef_search.max(topk)));
        }
        Ok(results)
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
        let bound = self.metric.score_bound(radius);
        let ef = max_results.max(self.params.ef_search);
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            let mut hits = self.search_one(query, ef, filter, ef);
            hits.retain(|hit| hit.score <= bound);
            if hits.len() > max_results {
                tracing::warn!(
                    limit = max_results,
                    actual = hits.len(),
                    "range search result count exceeds limit, truncating"
                );
                hits.truncate(max_results);
            }
            results.push(hits);
        }
        Ok(results)
    }

    fn count(&self) -> usize {
        self.ids.len() - self.deleted_count
    }

    fn deleted_count(&self) -> usize {
        self.deleted_count
    }

    fn memory_size(&self) -> usize {
        let vectors = self.vectors.len() * std::mem::size_of::<f32>();
        let links: usize = self
            .neighbors
            .iter()
            .flat_map(|layers| layers.iter())
            .map(|list| list.len() * std::mem::size_of::<u32>())
            .sum();
        vectors + links + self.ids.len() * (std::mem::size_of::<VectorId>() + 2)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn metric(&self) -> Metric {
        self.metric
    }
}

impl HnswIndex {
    fn search_one(
        &self,
        query: &[f32],
        topk: usize,
        filter: Option<&IndexFilter>,
        ef: usize,
    ) -> Vec<SearchHit> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        let query = self.metric.prepare(query);
        let mut visited = VisitedSet::new(self.ids.len());

        let mut current = entry;
        for layer in (1..=self.max_layer).rev() {
            let found = self.search_layer(&query, &[current], 1, layer, &mut visited, &|_| true);
            if let Some(&(_, nearest)) = found.first() {
                current = nearest;
            }
        }

        let keep: Box<dyn Fn(u32) -> bool> = match filter {
            Some(filter) => {
                let ids = &self.ids;
                Box::new(move |node: u32| filter.matches(ids[node as usize]))
            }
            None => Box::new(|_| true),
        };
        let found = self.search_layer(&query, &[current], ef.max(1), 0, &mut visited, keep.as_ref());

        let mut hits: Vec<SearchHit> = found
            .into_iter()
            .map(|(score, node)| SearchHit {
                id: self.ids[node as usize],
                score,
            })
            .collect();
        SearchHit::sort(&mut hits);
        hits.truncate(topk);
        hits
    }
}
