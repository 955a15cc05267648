//! Hybrid vector query engine.
//!
//! Joins the in-memory index with the KV ground truth: the `data` family
//! holds the authoritative payloads, `scalar`/`scalar_speedup` the filter
//! attributes, `table` the tabular payloads. Every read is versioned at the
//! request timestamp. Ids surfaced by the index but missing from the data
//! family (index lag) are logged and dropped from results, never surfaced
//! as errors.

use std::collections::BinaryHeap;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use tracing::{debug, warn};

use rangekv_core::codec;
use rangekv_core::config::VectorIndexConfig;
use rangekv_core::error::{StoreError, StoreResult};
use rangekv_core::types::{
    next_key, Embedding, OpContext, Range, ScalarField, ScalarFieldType, ScalarMap, ScalarSchema,
    TableData, VectorId, VectorWithDistance, VectorWithId,
};
use rangekv_storage::cf_names;
use rangekv_storage::{MvccReader, RawStore};

use crate::distance::Metric;
use crate::filter::{ExprFilter, ScalarPredicate};
use crate::flat::FlatIndex;
use crate::holder::VectorIndexHolder;
use crate::index::{IndexFilter, SearchHit, VectorIndexOps};

/// Synthetic columns a table predicate ranges over.
pub const TABLE_KEY_COLUMN: &str = "table_key";
pub const TABLE_VALUE_COLUMN: &str = "table_value";

fn table_schema() -> ScalarSchema {
    ScalarSchema {
        fields: vec![
            ScalarField {
                key: TABLE_KEY_COLUMN.to_string(),
                field_type: ScalarFieldType::Bytes,
                enable_speed_up: false,
            },
            ScalarField {
                key: TABLE_VALUE_COLUMN.to_string(),
                field_type: ScalarFieldType::Bytes,
                enable_speed_up: false,
            },
        ],
    }
}

/// How candidates are restricted before or after the ANN search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterKind {
    #[default]
    None,
    VectorId,
    ScalarPre,
    ScalarPost,
    TablePre,
}

/// Parameters of one batch-search request.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub top_n: usize,
    pub radius: f32,
    pub enable_range: bool,
    pub filter_kind: FilterKind,
    pub without_vector_data: bool,
    pub without_scalar_data: bool,
    pub without_table_data: bool,
    /// Scalar keys attached to results; empty means all.
    pub selected_scalar_keys: Vec<String>,
    /// Compiled scalar expression blob; wins over `scalar_map`.
    pub scalar_expression: Option<Vec<u8>>,
    /// Legacy equality map (deprecated in favor of the expression).
    pub scalar_map: ScalarMap,
    pub use_brute_force: bool,
    pub is_negate: bool,
    pub is_sorted: bool,
    pub vector_ids: Vec<VectorId>,
}

/// Parameters of an id-ordered scan.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub start_id: VectorId,
    /// Inclusive far bound; 0 leaves the scan open.
    pub end_id: VectorId,
    pub limit: usize,
    pub is_reverse: bool,
    pub without_vector_data: bool,
    pub without_scalar_data: bool,
    pub without_table_data: bool,
    pub selected_scalar_keys: Vec<String>,
    pub scalar_expression: Option<Vec<u8>>,
    pub scalar_map: ScalarMap,
}

/// Region-scoped request context.
#[derive(Debug, Clone)]
pub struct VectorQueryContext {
    pub ts: i64,
    /// Plain-key range of the region.
    pub region_range: Range,
    pub partition_id: i64,
    pub prefix: u8,
    pub schema: ScalarSchema,
}

impl VectorQueryContext {
    pub fn vector_key(&self, id: VectorId) -> Vec<u8> {
        codec::encode_vector_key(self.prefix, self.partition_id, id)
    }
}

/// Region-level vector metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorRegionMetrics {
    pub count: u64,
    pub deleted_count: usize,
    pub memory_size: usize,
    pub min_id: VectorId,
    pub max_id: VectorId,
}

pub struct VectorReader {
    reader: MvccReader,
    config: VectorIndexConfig,
}

impl VectorReader {
    pub fn new(store: Arc<RawStore>, config: VectorIndexConfig) -> Self {
        Self {
            reader: MvccReader::new(store),
            config,
        }
    }

    // ------------------------------------------------------------------
    // Point and scan reads
    // ------------------------------------------------------------------

    /// Fetch one record by id; `None` when no visible version exists.
    pub fn query(
        &self,
        ctx: &VectorQueryContext,
        id: VectorId,
        with_vector: bool,
    ) -> StoreResult<Option<VectorWithId>> {
        VectorWithId::validate_id(id)?;
        let Some(raw) = self
            .reader
            .kv_get(cf_names::DATA, ctx.ts, &ctx.vector_key(id))?
        else {
            return Ok(None);
        };
        let mut record = VectorWithId {
            id,
            ..Default::default()
        };
        if with_vector {
            record.embedding = Some(decode_embedding(&raw)?);
        }
        Ok(Some(record))
    }

    /// Batch point lookup; misses come back as `None` per position.
    pub fn batch_query(
        &self,
        ctx: &VectorQueryContext,
        ids: &[VectorId],
        req: &ScanRequest,
    ) -> StoreResult<Vec<Option<VectorWithId>>> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            let record = self.query(ctx, id, !req.without_vector_data)?;
            match record {
                Some(mut record) => {
                    self.attach_payloads(ctx, &mut record, req.without_scalar_data,
                        req.without_table_data, &req.selected_scalar_keys)?;
                    out.push(Some(record));
                }
                None => out.push(None),
            }
        }
        Ok(out)
    }

    /// Forward or reverse id-ordered scan with an optional scalar filter.
    pub fn scan_query(
        &self,
        ctx: &VectorQueryContext,
        req: &ScanRequest,
        op: &OpContext,
    ) -> StoreResult<Vec<VectorWithId>> {
        let predicate = ScalarPredicate::resolve(
            req.scalar_expression.as_deref(),
            &req.scalar_map,
            &ctx.schema,
        )?;
        let ids = if req.is_reverse {
            self.scan_ids_reverse(ctx, req, predicate.as_ref())?
        } else {
            self.scan_ids_forward(ctx, req, predicate.as_ref(), op)?
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(mut record) = self.query(ctx, id, !req.without_vector_data)? else {
                continue;
            };
            self.attach_payloads(ctx, &mut record, req.without_scalar_data,
                req.without_table_data, &req.selected_scalar_keys)?;
            out.push(record);
        }
        Ok(out)
    }

    fn scan_ids_forward(
        &self,
        ctx: &VectorQueryContext,
        req: &ScanRequest,
        predicate: Option<&ScalarPredicate>,
        op: &OpContext,
    ) -> StoreResult<Vec<VectorId>> {
        let mut start = ctx.vector_key(req.start_id.max(0));
        if start < ctx.region_range.start_key {
            start = ctx.region_range.start_key.clone();
        }
        let range = Range::new(start, ctx.region_range.end_key.clone());

        let mut ids = Vec::new();
        let mut failure: Option<StoreError> = None;
        self.reader
            .kv_scan_with(cf_names::DATA, ctx.ts, &range, |plain, _| {
                if let Err(err) = op.check() {
                    failure = Some(err);
                    return false;
                }
                let id = match codec::decode_vector_id_plain(plain) {
                    Ok(id) => id,
                    Err(err) => {
                        failure = Some(err);
                        return false;
                    }
                };
                if req.end_id != 0 && id > req.end_id {
                    return false;
                }
                match self.passes_predicate(ctx, id, predicate) {
                    Ok(true) => ids.push(id),
                    Ok(false) => {}
                    Err(err) => {
                        failure = Some(err);
                        return false;
                    }
                }
                req.limit == 0 || ids.len() < req.limit
            })?;
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(ids)
    }

    fn scan_ids_reverse(
        &self,
        ctx: &VectorQueryContext,
        req: &ScanRequest,
        predicate: Option<&ScalarPredicate>,
    ) -> StoreResult<Vec<VectorId>> {
        let mut end = next_key(&ctx.vector_key(req.start_id));
        if !ctx.region_range.end_key.is_empty() && end > ctx.region_range.end_key {
            end = ctx.region_range.end_key.clone();
        }
        let range = Range::new(ctx.region_range.start_key.clone(), end);

        // Reverse iteration cannot early-stop on the predicate, so fetch
        // key-only and filter afterwards.
        let fetch_limit = if predicate.is_some() { 0 } else { req.limit };
        let keys = self
            .reader
            .kv_scan_reverse(cf_names::DATA, ctx.ts, &range, fetch_limit, true)?;

        let mut ids = Vec::new();
        for kv in keys {
            let id = codec::decode_vector_id_plain(&kv.key)?;
            if req.end_id != 0 && id < req.end_id {
                break;
            }
            if self.passes_predicate(ctx, id, predicate)? {
                ids.push(id);
                if req.limit > 0 && ids.len() >= req.limit {
                    break;
                }
            }
        }
        Ok(ids)
    }

    fn passes_predicate(
        &self,
        ctx: &VectorQueryContext,
        id: VectorId,
        predicate: Option<&ScalarPredicate>,
    ) -> StoreResult<bool> {
        let Some(predicate) = predicate else {
            return Ok(true);
        };
        let scalar = self.load_scalar(ctx, id, &[])?;
        Ok(scalar.map(|map| predicate.eval(&map)).unwrap_or(false))
    }

    /// Smallest or largest visible vector id; 0 when the region is empty.
    pub fn get_border_id(&self, ctx: &VectorQueryContext, get_min: bool) -> StoreResult<VectorId> {
        let found = if get_min {
            self.reader
                .kv_min_key(cf_names::DATA, ctx.ts, &ctx.region_range)?
        } else {
            self.reader
                .kv_max_key(cf_names::DATA, ctx.ts, &ctx.region_range)?
        };
        match found {
            Some(plain) => codec::decode_vector_id_plain(&plain),
            None => Ok(0),
        }
    }

    /// Visible record count in the region at the request timestamp.
    pub fn count(&self, ctx: &VectorQueryContext) -> StoreResult<u64> {
        self.reader
            .kv_count(cf_names::DATA, ctx.ts, &ctx.region_range)
    }

    pub fn region_metrics(
        &self,
        ctx: &VectorQueryContext,
        holder: &VectorIndexHolder,
    ) -> StoreResult<VectorRegionMetrics> {
        let status = holder.status();
        Ok(VectorRegionMetrics {
            count: self.count(ctx)?,
            deleted_count: status.deleted_count,
            memory_size: status.memory_size,
            min_id: self.get_border_id(ctx, true)?,
            max_id: self.get_border_id(ctx, false)?,
        })
    }

    // ------------------------------------------------------------------
    // Search pipeline
    // ------------------------------------------------------------------

    /// Batch ANN search with the full filter pipeline.
    pub fn batch_search(
        &self,
        ctx: &VectorQueryContext,
        holder: &VectorIndexHolder,
        queries: &[VectorWithId],
        req: &SearchRequest,
        op: &OpContext,
    ) -> StoreResult<Vec<Vec<VectorWithDistance>>> {
        if queries.is_empty() {
            debug!("empty query batch");
            return Ok(Vec::new());
        }
        let metric = holder.params().metric();
        let dimension = holder.params().dimension();
        let query_vectors = prepare_queries(queries, dimension)?;

        let hits = match req.filter_kind {
            FilterKind::None => {
                self.search_wrapper(ctx, holder, &query_vectors, req, req.top_n, None, op)?
            }
            FilterKind::VectorId => {
                let filter =
                    IndexFilter::id_allow(req.vector_ids.clone(), req.is_negate, req.is_sorted);
                self.search_wrapper(ctx, holder, &query_vectors, req, req.top_n, Some(filter), op)?
            }
            FilterKind::ScalarPre => {
                let predicate = ScalarPredicate::resolve(
                    req.scalar_expression.as_deref(),
                    &req.scalar_map,
                    &ctx.schema,
                )?
                .ok_or_else(|| {
                    StoreError::Unsupported(
                        "scalar pre-filter requires an expression or scalar map".to_string(),
                    )
                })?;
                let columns = predicate.columns();
                let speed_up = ctx
                    .schema
                    .all_keys_speed_up(columns.iter().map(|s| s.as_str()));
                debug!(speed_up, ?columns, "scalar pre-filter candidate scan");
                let candidates = if speed_up {
                    self.scan_speedup_candidates(ctx, &predicate, &columns, op)?
                } else {
                    self.scan_scalar_candidates(ctx, &predicate, op)?
                };
                let filter = IndexFilter::id_allow(candidates, false, true);
                self.search_wrapper(ctx, holder, &query_vectors, req, req.top_n, Some(filter), op)?
            }
            FilterKind::ScalarPost => {
                let predicate = ScalarPredicate::resolve(
                    req.scalar_expression.as_deref(),
                    &req.scalar_map,
                    &ctx.schema,
                )?;
                match predicate {
                    None => self.search_wrapper(
                        ctx,
                        holder,
                        &query_vectors,
                        req,
                        req.top_n,
                        None,
                        op,
                    )?,
                    Some(predicate) => {
                        // Overfetch, then keep survivors of the predicate.
                        let overfetch = req.top_n.saturating_mul(10);
                        let raw_hits = self.search_wrapper(
                            ctx,
                            holder,
                            &query_vectors,
                            req,
                            overfetch,
                            None,
                            op,
                        )?;
                        let mut filtered = Vec::with_capacity(raw_hits.len());
                        for hits in raw_hits {
                            let mut kept = Vec::new();
                            for hit in hits {
                                if self.passes_predicate(ctx, hit.id, Some(&predicate))? {
                                    kept.push(hit);
                                    if !req.enable_range && kept.len() >= req.top_n {
                                        break;
                                    }
                                }
                            }
                            filtered.push(kept);
                        }
                        filtered
                    }
                }
            }
            FilterKind::TablePre => {
                let blob = req.scalar_expression.as_deref().ok_or_else(|| {
                    StoreError::Unsupported("table pre-filter requires an expression".to_string())
                })?;
                let filter = ExprFilter::open(blob, &table_schema())?;
                let candidates = self.scan_table_candidates(ctx, &filter, op)?;
                let filter = IndexFilter::id_allow(candidates, false, true);
                self.search_wrapper(ctx, holder, &query_vectors, req, req.top_n, Some(filter), op)?
            }
        };

        self.attach_results(ctx, metric, hits, req)
    }

    /// Route a search through the index, falling back to brute force when
    /// requested or when the variant cannot serve the request.
    #[allow(clippy::too_many_arguments)]
    fn search_wrapper(
        &self,
        ctx: &VectorQueryContext,
        holder: &VectorIndexHolder,
        queries: &[Vec<f32>],
        req: &SearchRequest,
        topk: usize,
        filter: Option<IndexFilter>,
        op: &OpContext,
    ) -> StoreResult<Vec<Vec<SearchHit>>> {
        let metric = holder.params().metric();
        let dimension = holder.params().dimension();

        if req.use_brute_force {
            return self.brute_force(ctx, metric, dimension, queries, req, topk, filter.as_ref(), op);
        }

        let result = if req.enable_range {
            holder.range_search(
                queries,
                req.radius,
                filter.as_ref(),
                self.config.max_range_search_result_count,
            )
        } else {
            holder.search(queries, topk, filter.as_ref())
        };
        match result {
            Err(StoreError::Unsupported(reason)) => {
                debug!(%reason, "index cannot serve request, using brute force");
                self.brute_force(ctx, metric, dimension, queries, req, topk, filter.as_ref(), op)
            }
            other => other,
        }
    }

    /// Exact search by streaming the data family through transient flat
    /// indices and merging per-query top-k heaps. Ordering semantics are
    /// identical to an index search.
    #[allow(clippy::too_many_arguments)]
    fn brute_force(
        &self,
        ctx: &VectorQueryContext,
        metric: Metric,
        dimension: usize,
        queries: &[Vec<f32>],
        req: &SearchRequest,
        topk: usize,
        filter: Option<&IndexFilter>,
        op: &OpContext,
    ) -> StoreResult<Vec<Vec<SearchHit>>> {
        let batch_size = self.config.bruteforce_batch_count.max(1);
        let range_cap = self.config.max_range_search_result_count;

        // Per-query merge state: a bounded max-heap for top-k, a capped list
        // for range mode.
        let mut heaps: Vec<BinaryHeap<(OrderedFloat<f32>, VectorId)>> =
            (0..queries.len()).map(|_| BinaryHeap::new()).collect();
        let mut range_hits: Vec<Vec<SearchHit>> = vec![Vec::new(); queries.len()];
        let mut truncated = false;

        let mut batch: Vec<(VectorId, Vec<f32>)> = Vec::with_capacity(batch_size);
        let mut failure: Option<StoreError> = None;

        let mut flush = |batch: &mut Vec<(VectorId, Vec<f32>)>,
                         heaps: &mut Vec<BinaryHeap<(OrderedFloat<f32>, VectorId)>>,
                         range_hits: &mut Vec<Vec<SearchHit>>,
                         truncated: &mut bool|
         -> StoreResult<()> {
            if batch.is_empty() {
                return Ok(());
            }
            let mut flat = FlatIndex::new(dimension, metric);
            flat.add(batch)?;
            batch.clear();
            if req.enable_range {
                let results = flat.range_search(queries, req.radius, filter, range_cap)?;
                for (per_query, hits) in range_hits.iter_mut().zip(results) {
                    for hit in hits {
                        if per_query.len() >= range_cap {
                            *truncated = true;
                            break;
                        }
                        per_query.push(hit);
                    }
                }
            } else {
                let results = flat.search(queries, topk, filter)?;
                for (heap, hits) in heaps.iter_mut().zip(results) {
                    for hit in hits {
                        let entry = (OrderedFloat(hit.score), hit.id);
                        if heap.len() < topk {
                            heap.push(entry);
                        } else if let Some(&top) = heap.peek() {
                            if entry < top {
                                heap.pop();
                                heap.push(entry);
                            }
                        }
                    }
                }
            }
            Ok(())
        };

        self.reader
            .kv_scan_with(cf_names::DATA, ctx.ts, &ctx.region_range, |plain, value| {
                if let Err(err) = op.check() {
                    failure = Some(err);
                    return false;
                }
                let parsed = codec::decode_vector_id_plain(plain)
                    .and_then(|id| decode_embedding(value).map(|e| (id, e)));
                match parsed {
                    Ok((id, Embedding::Float(values))) => {
                        batch.push((id, values));
                    }
                    Ok((_, Embedding::Binary(_))) => {
                        failure = Some(StoreError::Unsupported(
                            "brute force over binary embeddings".to_string(),
                        ));
                        return false;
                    }
                    Err(err) => {
                        failure = Some(err);
                        return false;
                    }
                }
                if batch.len() >= batch_size {
                    if let Err(err) =
                        flush(&mut batch, &mut heaps, &mut range_hits, &mut truncated)
                    {
                        failure = Some(err);
                        return false;
                    }
                }
                true
            })?;
        if let Some(err) = failure {
            return Err(err);
        }
        flush(&mut batch, &mut heaps, &mut range_hits, &mut truncated)?;

        if req.enable_range {
            if truncated {
                warn!(
                    limit = range_cap,
                    "brute-force range search truncated results at the cap"
                );
            }
            for hits in range_hits.iter_mut() {
                SearchHit::sort(hits);
            }
            Ok(range_hits)
        } else {
            Ok(heaps
                .into_iter()
                .map(|heap| {
                    let mut hits: Vec<SearchHit> = heap
                        .into_iter()
                        .map(|(score, id)| SearchHit { id, score: score.0 })
                        .collect();
                    SearchHit::sort(&mut hits);
                    hits
                })
                .collect())
        }
    }

    // ------------------------------------------------------------------
    // Candidate scans for pre-filters
    // ------------------------------------------------------------------

    /// Stream whole scalar maps and keep ids passing the predicate.
    fn scan_scalar_candidates(
        &self,
        ctx: &VectorQueryContext,
        predicate: &ScalarPredicate,
        op: &OpContext,
    ) -> StoreResult<Vec<VectorId>> {
        let mut ids = Vec::with_capacity(1024);
        let mut failure: Option<StoreError> = None;
        self.reader
            .kv_scan_with(cf_names::SCALAR, ctx.ts, &ctx.region_range, |plain, value| {
                if let Err(err) = op.check() {
                    failure = Some(err);
                    return false;
                }
                let parsed = codec::decode_vector_id_plain(plain).and_then(|id| {
                    decode_scalar_map(value).map(|map| (id, map))
                });
                match parsed {
                    Ok((id, map)) => {
                        if predicate.eval(&map) {
                            ids.push(id);
                        }
                        true
                    }
                    Err(err) => {
                        failure = Some(err);
                        false
                    }
                }
            })?;
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(ids)
    }

    /// Stream the speed-up family, reassembling one partial map per vector
    /// from its per-key rows, and keep ids passing the predicate. Requires
    /// every predicate column to be speed-up indexed.
    fn scan_speedup_candidates(
        &self,
        ctx: &VectorQueryContext,
        predicate: &ScalarPredicate,
        columns: &std::collections::BTreeSet<String>,
        op: &OpContext,
    ) -> StoreResult<Vec<VectorId>> {
        let mut ids = Vec::with_capacity(1024);
        let mut failure: Option<StoreError> = None;
        let mut current: Option<VectorId> = None;
        let mut partial = ScalarMap::new();

        {
            let mut finish =
                |id: Option<VectorId>, partial: &mut ScalarMap, ids: &mut Vec<VectorId>| {
                    if let Some(id) = id {
                        if predicate.eval(partial) {
                            ids.push(id);
                        }
                    }
                    partial.clear();
                };

            self.reader.kv_scan_with(
                cf_names::SCALAR_SPEEDUP,
                ctx.ts,
                &ctx.region_range,
                |plain, value| {
                    if let Err(err) = op.check() {
                        failure = Some(err);
                        return false;
                    }
                    let offset = codec::PREFIX_LEN + codec::PARTITION_LEN + codec::VECTOR_ID_LEN;
                    let parsed = codec::decode_vector_id_plain(plain).and_then(|id| {
                        if plain.len() <= offset {
                            return Err(StoreError::CorruptKey(
                                "speedup key has no scalar name".to_string(),
                            ));
                        }
                        let scalar_key = String::from_utf8(plain[offset..].to_vec())
                            .map_err(|e| StoreError::CorruptKey(e.to_string()))?;
                        Ok((id, scalar_key))
                    });
                    let (id, scalar_key) = match parsed {
                        Ok(parts) => parts,
                        Err(err) => {
                            failure = Some(err);
                            return false;
                        }
                    };
                    if current != Some(id) {
                        finish(current.take(), &mut partial, &mut ids);
                        current = Some(id);
                    }
                    if columns.contains(&scalar_key) {
                        match decode_scalar_value(value) {
                            Ok(scalar_value) => {
                                partial.insert(scalar_key, scalar_value);
                            }
                            Err(err) => {
                                failure = Some(err);
                                return false;
                            }
                        }
                    }
                    true
                },
            )?;
            finish(current, &mut partial, &mut ids);
        }
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(ids)
    }

    /// Stream the table family and keep ids whose table payload passes the
    /// expression.
    fn scan_table_candidates(
        &self,
        ctx: &VectorQueryContext,
        filter: &ExprFilter,
        op: &OpContext,
    ) -> StoreResult<Vec<VectorId>> {
        let mut ids = Vec::with_capacity(1024);
        let mut failure: Option<StoreError> = None;
        self.reader
            .kv_scan_with(cf_names::TABLE, ctx.ts, &ctx.region_range, |plain, value| {
                if let Err(err) = op.check() {
                    failure = Some(err);
                    return false;
                }
                let parsed = codec::decode_vector_id_plain(plain).and_then(|id| {
                    decode_table_data(value).map(|table| (id, table))
                });
                match parsed {
                    Ok((id, table)) => {
                        let mut record = ScalarMap::new();
                        record.insert(
                            TABLE_KEY_COLUMN.to_string(),
                            rangekv_core::types::ScalarValue::Bytes(table.table_key),
                        );
                        record.insert(
                            TABLE_VALUE_COLUMN.to_string(),
                            rangekv_core::types::ScalarValue::Bytes(table.table_value),
                        );
                        if filter.eval(&record) {
                            ids.push(id);
                        }
                        true
                    }
                    Err(err) => {
                        failure = Some(err);
                        false
                    }
                }
            })?;
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Payload attachment
    // ------------------------------------------------------------------

    fn attach_results(
        &self,
        ctx: &VectorQueryContext,
        metric: Metric,
        hits: Vec<Vec<SearchHit>>,
        req: &SearchRequest,
    ) -> StoreResult<Vec<Vec<VectorWithDistance>>> {
        let mut out = Vec::with_capacity(hits.len());
        for per_query in hits {
            let mut results = Vec::with_capacity(per_query.len());
            for hit in per_query {
                let mut record = VectorWithId {
                    id: hit.id,
                    ..Default::default()
                };
                if !req.without_vector_data {
                    match self
                        .reader
                        .kv_get(cf_names::DATA, ctx.ts, &ctx.vector_key(hit.id))?
                    {
                        Some(raw) => record.embedding = Some(decode_embedding(&raw)?),
                        None => {
                            // Index is ahead of (or behind) the KV side for
                            // this id; drop the stale candidate.
                            warn!(id = hit.id, "vector in index but not in data family");
                            continue;
                        }
                    }
                }
                self.attach_payloads(ctx, &mut record, req.without_scalar_data,
                    req.without_table_data, &req.selected_scalar_keys)?;
                results.push(VectorWithDistance {
                    record,
                    distance: metric.display_distance(hit.score),
                });
            }
            out.push(results);
        }
        Ok(out)
    }

    fn attach_payloads(
        &self,
        ctx: &VectorQueryContext,
        record: &mut VectorWithId,
        without_scalar: bool,
        without_table: bool,
        selected_scalar_keys: &[String],
    ) -> StoreResult<()> {
        if !without_scalar {
            if let Some(scalar) = self.load_scalar(ctx, record.id, selected_scalar_keys)? {
                record.scalar = scalar;
            }
        }
        if !without_table {
            record.table = self.load_table(ctx, record.id)?;
        }
        Ok(())
    }

    fn load_scalar(
        &self,
        ctx: &VectorQueryContext,
        id: VectorId,
        selected: &[String],
    ) -> StoreResult<Option<ScalarMap>> {
        let Some(raw) = self
            .reader
            .kv_get(cf_names::SCALAR, ctx.ts, &ctx.vector_key(id))?
        else {
            return Ok(None);
        };
        let mut map = decode_scalar_map(&raw)?;
        if !selected.is_empty() {
            map.retain(|key, _| selected.iter().any(|s| s == key));
        }
        Ok(Some(map))
    }

    fn load_table(
        &self,
        ctx: &VectorQueryContext,
        id: VectorId,
    ) -> StoreResult<Option<TableData>> {
        match self
            .reader
            .kv_get(cf_names::TABLE, ctx.ts, &ctx.vector_key(id))?
        {
            Some(raw) => Ok(Some(decode_table_data(&raw)?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Build / diagnostics
    // ------------------------------------------------------------------

    /// Build the index from a full scan of the data family at `ts`.
    pub fn build(
        &self,
        ctx: &VectorQueryContext,
        holder: &VectorIndexHolder,
        epoch_version: i64,
        op: &OpContext,
    ) -> StoreResult<usize> {
        holder.begin_build()?;
        let result = self.build_inner(ctx, holder, epoch_version, op);
        if result.is_err() {
            holder.abort_build();
        }
        result
    }

    fn build_inner(
        &self,
        ctx: &VectorQueryContext,
        holder: &VectorIndexHolder,
        epoch_version: i64,
        op: &OpContext,
    ) -> StoreResult<usize> {
        let mut records: Vec<(VectorId, Vec<f32>)> = Vec::new();
        let mut failure: Option<StoreError> = None;
        self.reader
            .kv_scan_with(cf_names::DATA, ctx.ts, &ctx.region_range, |plain, value| {
                if let Err(err) = op.check() {
                    failure = Some(err);
                    return false;
                }
                let parsed = codec::decode_vector_id_plain(plain)
                    .and_then(|id| decode_embedding(value).map(|e| (id, e)));
                match parsed {
                    Ok((id, Embedding::Float(values))) => {
                        records.push((id, values));
                        true
                    }
                    Ok((_, Embedding::Binary(_))) => {
                        failure = Some(StoreError::Unsupported(
                            "index build over binary embeddings".to_string(),
                        ));
                        false
                    }
                    Err(err) => {
                        failure = Some(err);
                        false
                    }
                }
            })?;
        if let Some(err) = failure {
            return Err(err);
        }

        let mut index = holder.params().build_empty();
        index.add(&records)?;
        let count = records.len();
        holder.install(index, ctx.ts, epoch_version);
        Ok(count)
    }

    /// Human-readable dump of the region's vector state.
    pub fn dump(
        &self,
        ctx: &VectorQueryContext,
        holder: &VectorIndexHolder,
        dump_all: bool,
    ) -> StoreResult<Vec<String>> {
        let status = holder.status();
        let mut lines = vec![format!(
            "index state={:?} variant={} count={} deleted={} memory={} apply_ts={}",
            status.state,
            status.variant.unwrap_or("-"),
            status.count,
            status.deleted_count,
            status.memory_size,
            status.apply_ts,
        )];
        if dump_all {
            let mut failure: Option<StoreError> = None;
            self.reader
                .kv_scan_with(cf_names::DATA, ctx.ts, &ctx.region_range, |plain, value| {
                    let parsed = codec::decode_vector_id_plain(plain)
                        .and_then(|id| decode_embedding(value).map(|e| (id, e)));
                    match parsed {
                        Ok((id, embedding)) => {
                            lines.push(format!("id={} dim={}", id, embedding.dimension()));
                            true
                        }
                        Err(err) => {
                            failure = Some(err);
                            false
                        }
                    }
                })?;
            if let Some(err) = failure {
                return Err(err);
            }
        }
        Ok(lines)
    }
}

/// Pairwise distances between two vector sets under a metric.
pub fn calc_distance(
    metric: Metric,
    left: &[Vec<f32>],
    right: &[Vec<f32>],
) -> StoreResult<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(left.len());
    for l in left {
        let prepared_l = metric.prepare(l);
        let mut row = Vec::with_capacity(right.len());
        for r in right {
            if l.len() != r.len() {
                return Err(StoreError::DimensionMismatch {
                    expected: l.len(),
                    actual: r.len(),
                });
            }
            let prepared_r = metric.prepare(r);
            row.push(metric.display_distance(metric.score(&prepared_l, &prepared_r)));
        }
        out.push(row);
    }
    Ok(out)
}

fn prepare_queries(queries: &[VectorWithId], dimension: usize) -> StoreResult<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(queries.len());
    for query in queries {
        let embedding = query
            .embedding
            .as_ref()
            .ok_or_else(|| StoreError::Unsupported("search query without embedding".to_string()))?;
        let values = embedding.as_float().ok_or_else(|| {
            StoreError::Unsupported("binary embeddings are not searchable".to_string())
        })?;
        if values.len() != dimension {
            return Err(StoreError::DimensionMismatch {
                expected: dimension,
                actual: values.len(),
            });
        }
        out.push(values.to_vec());
    }
    Ok(out)
}

pub fn encode_embedding(embedding: &Embedding) -> Vec<u8> {
    bincode::serialize(embedding).expect("embedding serialization is infallible")
}

pub fn decode_embedding(raw: &[u8]) -> StoreResult<Embedding> {
    bincode::deserialize(raw).map_err(|e| StoreError::Corruption {
        location: "vector data".to_string(),
        details: e.to_string(),
    })
}

pub fn encode_scalar_map(map: &ScalarMap) -> Vec<u8> {
    bincode::serialize(map).expect("scalar map serialization is infallible")
}

pub fn decode_scalar_map(raw: &[u8]) -> StoreResult<ScalarMap> {
    bincode::deserialize(raw).map_err(|e| StoreError::Corruption {
        location: "vector scalar".to_string(),
        details: e.to_string(),
    })
}

pub fn encode_scalar_value(value: &rangekv_core::types::ScalarValue) -> Vec<u8> {
    bincode::serialize(value).expect("scalar value serialization is infallible")
}

pub fn decode_scalar_value(raw: &[u8]) -> StoreResult<rangekv_core::types::ScalarValue> {
    bincode::deserialize(raw).map_err(|e| StoreError::Corruption {
        location: "vector scalar speedup".to_string(),
        details: e.to_string(),
    })
}

pub fn encode_table_data(table: &TableData) -> Vec<u8> {
    bincode::serialize(table).expect("table data serialization is infallible")
}

pub fn decode_table_data(raw: &[u8]) -> StoreResult<TableData> {
    bincode::deserialize(raw).map_err(|e| StoreError::Corruption {
        location: "vector table".to_string(),
        details: e.to_string(),
    })
}
