//! The per-region operation surface.
//!
//! `RegionStore` glues the storage and vector subsystems together for one
//! region: it validates epochs and key ranges, acquires timestamps, routes
//! to the raw/MVCC/transaction/vector paths, and translates component
//! failures. Corruption flips the region read-only and is surfaced as-is;
//! everything else is returned for the RPC layer to map.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info};

use rangekv_core::codec;
use rangekv_core::config::Config;
use rangekv_core::error::{StoreError, StoreResult};
use rangekv_core::ts::TsProvider;
use rangekv_core::types::{
    KeyValue, OpContext, Range, RangeWithOptions, RegionEpoch, RegionType, ScalarSchema,
    VectorId, VectorWithDistance, VectorWithId,
};
use rangekv_storage::cf_names;
use rangekv_storage::txn::{
    PrewriteRequest, PrewriteResult, SecondaryLocksStatus, TxnDump, TxnEngine, TxnStatus,
};
use rangekv_storage::{MvccReader, RawStore, RawWriteBatch, SstFileMeta};
use rangekv_vector::holder::index_snapshot_path;
use rangekv_vector::reader::{
    encode_embedding, encode_scalar_map, encode_scalar_value, encode_table_data,
};
use rangekv_vector::{
    calc_distance, IndexStatus, Metric, ScanRequest, SearchRequest, VectorIndexHolder,
    VectorIndexParams, VectorQueryContext, VectorReader, VectorRegionMetrics,
};

use crate::region::Region;

/// Result of a ranged scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvScanResult {
    /// User-key/value pairs in scan order.
    pub kvs: Vec<KeyValue>,
    pub has_more: bool,
    /// Last user key returned; resume point for the next page.
    pub end_key: Vec<u8>,
}

pub struct RegionStore {
    region: Arc<Region>,
    raw: Arc<RawStore>,
    ts: Arc<TsProvider>,
    mvcc: MvccReader,
    txn: TxnEngine,
    vreader: VectorReader,
    vholder: Option<Arc<VectorIndexHolder>>,
    schema: ScalarSchema,
    config: Config,
    base_dir: PathBuf,
}

impl RegionStore {
    pub fn new(
        region: Arc<Region>,
        raw: Arc<RawStore>,
        ts: Arc<TsProvider>,
        config: Config,
        base_dir: PathBuf,
        schema: ScalarSchema,
        index_params: Option<VectorIndexParams>,
    ) -> Self {
        let vholder = index_params.map(|params| Arc::new(VectorIndexHolder::new(params)));
        Self {
            mvcc: MvccReader::new(Arc::clone(&raw)),
            txn: TxnEngine::new(Arc::clone(&raw)),
            vreader: VectorReader::new(Arc::clone(&raw), config.vector_index.clone()),
            region,
            raw,
            ts,
            vholder,
            schema,
            config,
            base_dir,
        }
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    pub fn raw_store(&self) -> &Arc<RawStore> {
        &self.raw
    }

    pub fn schema(&self) -> &ScalarSchema {
        &self.schema
    }

    pub fn index_holder(&self) -> Option<&Arc<VectorIndexHolder>> {
        self.vholder.as_ref()
    }

    pub fn check_epoch(&self, expected: Option<RegionEpoch>) -> StoreResult<()> {
        self.region.check_epoch(expected)
    }

    /// Corruption is fatal for the region: emit the event, stop serving.
    fn guard<T>(&self, result: StoreResult<T>) -> StoreResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                error!(region = self.region.id(), error = %err, "corruption detected, region now read-only");
                self.region.mark_read_only();
            }
        }
        result
    }

    fn plain_key_checked(&self, user_key: &[u8]) -> StoreResult<Vec<u8>> {
        if user_key.is_empty() {
            return Err(StoreError::KeyEmpty);
        }
        let plain = self.region.plain_key(user_key);
        self.region.check_key_in_range(&plain)?;
        Ok(plain)
    }

    /// Resolve a user range to a plain range clipped to the region.
    fn plain_range(&self, user_range: &Range) -> StoreResult<Range> {
        user_range.validate()?;
        let region_range = self.region.range();
        let mut start = self.region.plain_key(&user_range.start_key);
        if start < region_range.start_key {
            start = region_range.start_key.clone();
        }
        let end = if user_range.end_key.is_empty() {
            region_range.end_key.clone()
        } else {
            let plain_end = self.region.plain_key(&user_range.end_key);
            if region_range.end_key.is_empty() || plain_end < region_range.end_key {
                plain_end
            } else {
                region_range.end_key.clone()
            }
        };
        Ok(Range::new(start, end))
    }

    fn user_key_of(plain: &[u8]) -> StoreResult<Vec<u8>> {
        let (_, _, user) = codec::decode_plain_key(plain)?;
        Ok(user.to_vec())
    }

    // ==================================================================
    // Raw KV operations
    // ==================================================================

    pub fn kv_get(&self, ts: i64, user_key: &[u8]) -> StoreResult<Vec<u8>> {
        self.region.check_serving()?;
        let plain = self.plain_key_checked(user_key)?;
        let found = self.guard(self.mvcc.kv_get(cf_names::DATA, ts, &plain))?;
        found.ok_or(StoreError::KeyNotFound)
    }

    pub fn kv_batch_get(&self, ts: i64, user_keys: &[Vec<u8>]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        self.region.check_serving()?;
        let mut out = Vec::with_capacity(user_keys.len());
        for user_key in user_keys {
            let plain = self.plain_key_checked(user_key)?;
            out.push(self.guard(self.mvcc.kv_get(cf_names::DATA, ts, &plain))?);
        }
        Ok(out)
    }

    /// Write a batch of values at one fresh timestamp; returns it.
    pub fn kv_put(&self, kvs: &[KeyValue]) -> StoreResult<i64> {
        self.kv_put_inner(kvs, None)
    }

    pub fn kv_put_with_ttl(&self, kvs: &[KeyValue], ttl_ms: i64) -> StoreResult<i64> {
        self.kv_put_inner(kvs, Some(ttl_ms))
    }

    fn kv_put_inner(&self, kvs: &[KeyValue], ttl_ms: Option<i64>) -> StoreResult<i64> {
        self.region.check_writable()?;
        let ts = self.ts.acquire_ts()?;
        let mut batch = RawWriteBatch::new();
        for kv in kvs {
            let plain = self.plain_key_checked(&kv.key)?;
            let value = match ttl_ms {
                Some(ttl_ms) => codec::pack_value_with_ttl(
                    codec::FLAG_NONE,
                    rangekv_core::types::current_time_ms() + ttl_ms,
                    &kv.value,
                ),
                None => codec::pack_value(codec::FLAG_NONE, &kv.value),
            };
            batch.put(cf_names::DATA, codec::append_ts(&plain, ts), value);
        }
        self.raw.write(batch)?;
        Ok(ts)
    }

    /// Logical delete: a tombstone version at a fresh timestamp.
    pub fn kv_delete(&self, user_keys: &[Vec<u8>]) -> StoreResult<i64> {
        self.region.check_writable()?;
        let ts = self.ts.acquire_ts()?;
        let mut batch = RawWriteBatch::new();
        for user_key in user_keys {
            let plain = self.plain_key_checked(user_key)?;
            batch.put(
                cf_names::DATA,
                codec::append_ts(&plain, ts),
                codec::tombstone_value(),
            );
        }
        self.raw.write(batch)?;
        Ok(ts)
    }

    /// Physical delete of a user range, history included. An empty resolved
    /// range is a no-op.
    pub fn kv_delete_range(&self, range: &RangeWithOptions) -> StoreResult<()> {
        self.region.check_writable()?;
        range.range.validate()?;
        let Some(resolved) = range.to_half_open() else {
            return Ok(());
        };
        let plain = self.plain_range(&resolved)?;
        if plain.is_empty() {
            return Ok(());
        }
        self.raw
            .delete_range(cf_names::DATA, &codec::encode_range(&plain))
    }

    pub fn kv_scan(
        &self,
        ts: i64,
        user_range: &Range,
        limit: usize,
        key_only: bool,
        reverse: bool,
    ) -> StoreResult<KvScanResult> {
        self.region.check_serving()?;
        let plain = self.plain_range(user_range)?;
        let kvs = self.guard(if reverse {
            self.mvcc
                .kv_scan_reverse(cf_names::DATA, ts, &plain, limit, key_only)
        } else {
            self.mvcc.kv_scan(cf_names::DATA, ts, &plain, limit, key_only)
        })?;

        let mut result = KvScanResult {
            has_more: limit > 0 && kvs.len() >= limit,
            ..Default::default()
        };
        for kv in kvs {
            result.end_key = Self::user_key_of(&kv.key)?;
            result.kvs.push(KeyValue::new(result.end_key.clone(), kv.value));
        }
        Ok(result)
    }

    pub fn kv_count(&self, ts: i64, user_range: &Range) -> StoreResult<u64> {
        self.region.check_serving()?;
        let plain = self.plain_range(user_range)?;
        self.guard(self.mvcc.kv_count(cf_names::DATA, ts, &plain))
    }

    // ==================================================================
    // Transactional operations
    // ==================================================================

    pub fn txn_get(&self, ts: i64, user_key: &[u8]) -> StoreResult<Vec<u8>> {
        self.region.check_serving()?;
        let plain = self.plain_key_checked(user_key)?;
        let found = self.guard(self.txn.get(&plain, ts))?;
        found.ok_or(StoreError::KeyNotFound)
    }

    pub fn txn_scan(
        &self,
        ts: i64,
        user_range: &Range,
        limit: usize,
        key_only: bool,
        op: &OpContext,
    ) -> StoreResult<KvScanResult> {
        self.region.check_serving()?;
        let plain = self.plain_range(user_range)?;
        let kvs = self.guard(self.txn.scan(&plain, ts, limit, key_only, op))?;
        let mut result = KvScanResult {
            has_more: limit > 0 && kvs.len() >= limit,
            ..Default::default()
        };
        for kv in kvs {
            result.end_key = Self::user_key_of(&kv.key)?;
            result.kvs.push(KeyValue::new(result.end_key.clone(), kv.value));
        }
        Ok(result)
    }

    pub fn txn_pessimistic_lock(
        &self,
        user_keys: &[Vec<u8>],
        primary: &[u8],
        start_ts: i64,
        for_update_ts: i64,
        lock_ttl_ms: i64,
    ) -> StoreResult<()> {
        self.region.check_writable()?;
        let keys = self.plain_keys(user_keys)?;
        let primary = self.plain_key_checked(primary)?;
        self.txn
            .pessimistic_lock(&keys, &primary, start_ts, for_update_ts, lock_ttl_ms)
    }

    pub fn txn_pessimistic_rollback(
        &self,
        user_keys: &[Vec<u8>],
        start_ts: i64,
        for_update_ts: i64,
    ) -> StoreResult<()> {
        self.region.check_writable()?;
        let keys = self.plain_keys(user_keys)?;
        self.txn.pessimistic_rollback(&keys, start_ts, for_update_ts)
    }

    /// Prewrite with user-space mutations; keys are translated into the
    /// region keyspace here.
    pub fn txn_prewrite(&self, mut req: PrewriteRequest) -> StoreResult<PrewriteResult> {
        self.region.check_writable()?;
        for mutation in &mut req.mutations {
            mutation.key = self.plain_key_checked(&mutation.key)?;
        }
        req.primary = self.plain_key_checked(&req.primary)?;
        req.secondaries = self.plain_keys(&req.secondaries)?;
        self.txn.prewrite(req)
    }

    pub fn txn_commit(
        &self,
        user_keys: &[Vec<u8>],
        start_ts: i64,
        commit_ts: i64,
    ) -> StoreResult<()> {
        self.region.check_writable()?;
        let keys = self.plain_keys(user_keys)?;
        self.txn.commit(&keys, start_ts, commit_ts)
    }

    pub fn txn_batch_rollback(&self, user_keys: &[Vec<u8>], start_ts: i64) -> StoreResult<()> {
        self.region.check_writable()?;
        let keys = self.plain_keys(user_keys)?;
        self.txn.batch_rollback(&keys, start_ts)
    }

    pub fn txn_resolve_lock(
        &self,
        start_ts: i64,
        commit_ts: i64,
        user_keys: &[Vec<u8>],
    ) -> StoreResult<()> {
        self.region.check_writable()?;
        let keys = self.plain_keys(user_keys)?;
        self.txn
            .resolve_lock(&self.region.range(), start_ts, commit_ts, &keys)
    }

    pub fn txn_check_txn_status(
        &self,
        primary: &[u8],
        lock_ts: i64,
        caller_start_ts: i64,
        current_ts: i64,
    ) -> StoreResult<TxnStatus> {
        self.region.check_serving()?;
        let primary = self.plain_key_checked(primary)?;
        self.txn
            .check_txn_status(&primary, lock_ts, caller_start_ts, current_ts)
    }

    pub fn txn_check_secondary_locks(
        &self,
        user_keys: &[Vec<u8>],
        start_ts: i64,
    ) -> StoreResult<SecondaryLocksStatus> {
        self.region.check_serving()?;
        let keys = self.plain_keys(user_keys)?;
        self.txn.check_secondary_locks(&keys, start_ts)
    }

    pub fn txn_heart_beat(
        &self,
        primary: &[u8],
        start_ts: i64,
        advise_ttl_ms: i64,
    ) -> StoreResult<i64> {
        self.region.check_writable()?;
        let primary = self.plain_key_checked(primary)?;
        self.txn.heartbeat(&primary, start_ts, advise_ttl_ms)
    }

    pub fn txn_scan_lock(
        &self,
        max_ts: i64,
        user_range: &Range,
        limit: usize,
    ) -> StoreResult<Vec<(Vec<u8>, rangekv_storage::txn::LockRecord)>> {
        self.region.check_serving()?;
        let plain = self.plain_range(user_range)?;
        let locks = self.txn.scan_lock(&plain, max_ts, limit)?;
        locks
            .into_iter()
            .map(|(key, lock)| Ok((Self::user_key_of(&key)?, lock)))
            .collect()
    }

    pub fn txn_delete_range(&self, user_range: &Range) -> StoreResult<()> {
        self.region.check_writable()?;
        let plain = self.plain_range(user_range)?;
        self.txn.delete_range(&plain)
    }

    pub fn txn_gc(&self, safe_point_ts: i64, op: &OpContext) -> StoreResult<u64> {
        self.region.check_writable()?;
        self.txn.gc(&self.region.range(), safe_point_ts, op)
    }

    pub fn txn_dump(&self) -> StoreResult<TxnDump> {
        self.region.check_serving()?;
        self.txn.dump(&self.region.range())
    }

    fn plain_keys(&self, user_keys: &[Vec<u8>]) -> StoreResult<Vec<Vec<u8>>> {
        user_keys
            .iter()
            .map(|key| self.plain_key_checked(key))
            .collect()
    }

    // ==================================================================
    // Vector operations
    // ==================================================================

    fn vector_holder(&self) -> StoreResult<&Arc<VectorIndexHolder>> {
        if self.region.region_type() != RegionType::VectorIndex {
            return Err(StoreError::Unsupported(
                "not a vector index region".to_string(),
            ));
        }
        self.vholder
            .as_ref()
            .ok_or_else(|| StoreError::Unsupported("region has no vector index".to_string()))
    }

    fn vector_ctx(&self, ts: i64) -> VectorQueryContext {
        VectorQueryContext {
            ts,
            region_range: self.region.range(),
            partition_id: self.region.partition_id(),
            prefix: self.region.prefix(),
            schema: self.schema.clone(),
        }
    }

    /// Insert or overwrite vector records at one fresh timestamp.
    pub fn vector_add(&self, records: &[VectorWithId]) -> StoreResult<i64> {
        self.region.check_writable()?;
        let holder = self.vector_holder()?;
        let dimension = holder.params().dimension();

        for record in records {
            VectorWithId::validate_id(record.id)?;
            let embedding = record.embedding.as_ref().ok_or_else(|| {
                StoreError::Internal(format!("vector {} has no embedding", record.id))
            })?;
            if embedding.dimension() != dimension {
                return Err(StoreError::DimensionMismatch {
                    expected: dimension,
                    actual: embedding.dimension(),
                });
            }
        }

        let ts = self.ts.acquire_ts()?;
        let mut batch = RawWriteBatch::new();
        let mut index_records = Vec::with_capacity(records.len());
        for record in records {
            let plain = self
                .region
                .plain_key(&record.id.to_be_bytes());
            self.region.check_key_in_range(&plain)?;

            let embedding = record.embedding.as_ref().expect("validated above");
            batch.put(
                cf_names::DATA,
                codec::append_ts(&plain, ts),
                codec::pack_value(codec::FLAG_NONE, &encode_embedding(embedding)),
            );
            if !record.scalar.is_empty() {
                batch.put(
                    cf_names::SCALAR,
                    codec::append_ts(&plain, ts),
                    codec::pack_value(codec::FLAG_NONE, &encode_scalar_map(&record.scalar)),
                );
                for (key, value) in &record.scalar {
                    let speed_up = self
                        .schema
                        .field(key)
                        .map(|field| field.enable_speed_up)
                        .unwrap_or(false);
                    if speed_up {
                        let speedup_key = codec::encode_scalar_speedup_key(
                            self.region.prefix(),
                            self.region.partition_id(),
                            record.id,
                            key,
                        );
                        batch.put(
                            cf_names::SCALAR_SPEEDUP,
                            codec::append_ts(&speedup_key, ts),
                            codec::pack_value(codec::FLAG_NONE, &encode_scalar_value(value)),
                        );
                    }
                }
            }
            if let Some(table) = &record.table {
                batch.put(
                    cf_names::TABLE,
                    codec::append_ts(&plain, ts),
                    codec::pack_value(codec::FLAG_NONE, &encode_table_data(table)),
                );
            }
            if let Some(values) = embedding.as_float() {
                index_records.push((record.id, values.to_vec()));
            }
        }
        self.raw.write(batch)?;
        holder.add(&index_records, ts)?;
        Ok(ts)
    }

    /// Logical delete: index tombstone plus tombstoned versions in every
    /// vector family.
    pub fn vector_delete(&self, ids: &[VectorId]) -> StoreResult<i64> {
        self.region.check_writable()?;
        let holder = self.vector_holder()?;

        let ts = self.ts.acquire_ts()?;
        let ctx = self.vector_ctx(0);
        let mut batch = RawWriteBatch::new();
        for &id in ids {
            VectorWithId::validate_id(id)?;
            let plain = ctx.vector_key(id);
            batch.put(
                cf_names::DATA,
                codec::append_ts(&plain, ts),
                codec::tombstone_value(),
            );
            batch.put(
                cf_names::SCALAR,
                codec::append_ts(&plain, ts),
                codec::tombstone_value(),
            );
            batch.put(
                cf_names::TABLE,
                codec::append_ts(&plain, ts),
                codec::tombstone_value(),
            );
            // Tombstone the per-key speedup rows the record materialized.
            if let Some(scalar) =
                self.guard(self.mvcc.kv_get(cf_names::SCALAR, 0, &plain))?
            {
                let map = rangekv_vector::reader::decode_scalar_map(&scalar)?;
                for key in map.keys() {
                    let speedup_key = codec::encode_scalar_speedup_key(
                        self.region.prefix(),
                        self.region.partition_id(),
                        id,
                        key,
                    );
                    batch.put(
                        cf_names::SCALAR_SPEEDUP,
                        codec::append_ts(&speedup_key, ts),
                        codec::tombstone_value(),
                    );
                }
            }
        }
        self.raw.write(batch)?;
        holder.delete(ids, ts)?;
        Ok(ts)
    }

    pub fn vector_batch_query(
        &self,
        ts: i64,
        ids: &[VectorId],
        req: &ScanRequest,
    ) -> StoreResult<Vec<Option<VectorWithId>>> {
        self.region.check_serving()?;
        self.vector_holder()?;
        let ctx = self.vector_ctx(ts);
        self.guard(self.vreader.batch_query(&ctx, ids, req))
    }

    pub fn vector_batch_search(
        &self,
        ts: i64,
        queries: &[VectorWithId],
        req: &SearchRequest,
        op: &OpContext,
    ) -> StoreResult<Vec<Vec<VectorWithDistance>>> {
        self.region.check_serving()?;
        let holder = self.vector_holder()?;
        let ctx = self.vector_ctx(ts);
        self.guard(self.vreader.batch_search(&ctx, holder, queries, req, op))
    }

    pub fn vector_scan_query(
        &self,
        ts: i64,
        req: &ScanRequest,
        op: &OpContext,
    ) -> StoreResult<Vec<VectorWithId>> {
        self.region.check_serving()?;
        self.vector_holder()?;
        let ctx = self.vector_ctx(ts);
        self.guard(self.vreader.scan_query(&ctx, req, op))
    }

    pub fn vector_get_border_id(&self, ts: i64, get_min: bool) -> StoreResult<VectorId> {
        self.region.check_serving()?;
        self.vector_holder()?;
        let ctx = self.vector_ctx(ts);
        self.guard(self.vreader.get_border_id(&ctx, get_min))
    }

    pub fn vector_count(
        &self,
        ts: i64,
        start_id: VectorId,
        end_id: VectorId,
    ) -> StoreResult<u64> {
        self.region.check_serving()?;
        self.vector_holder()?;
        let mut ctx = self.vector_ctx(ts);
        let region_range = self.region.range();
        let mut start = ctx.vector_key(start_id.max(0));
        if start < region_range.start_key {
            start = region_range.start_key.clone();
        }
        let end = if end_id == 0 {
            region_range.end_key.clone()
        } else {
            let bound = ctx.vector_key(end_id);
            if region_range.end_key.is_empty() || bound < region_range.end_key {
                bound
            } else {
                region_range.end_key.clone()
            }
        };
        ctx.region_range = Range::new(start, end);
        self.guard(self.vreader.count(&ctx))
    }

    pub fn vector_get_region_metrics(&self) -> StoreResult<VectorRegionMetrics> {
        self.region.check_serving()?;
        let holder = self.vector_holder()?;
        let ctx = self.vector_ctx(0);
        self.guard(self.vreader.region_metrics(&ctx, holder))
    }

    /// Build the index from the data family at `ts` (0 = latest).
    pub fn vector_build(&self, ts: i64, op: &OpContext) -> StoreResult<usize> {
        self.region.check_serving()?;
        let holder = self.vector_holder()?;
        let ctx = self.vector_ctx(ts);
        let epoch_version = self.region.epoch().version;
        let count = self.guard(self.vreader.build(&ctx, holder, epoch_version, op))?;
        info!(region = self.region.id(), count, "vector index built");
        Ok(count)
    }

    fn snapshot_path(&self) -> PathBuf {
        index_snapshot_path(&self.base_dir, self.region.id())
    }

    pub fn vector_save(&self) -> StoreResult<PathBuf> {
        let holder = self.vector_holder()?;
        let path = self.snapshot_path();
        holder.save(&path)?;
        Ok(path)
    }

    pub fn vector_load(&self) -> StoreResult<()> {
        let holder = self.vector_holder()?;
        holder.load(&self.snapshot_path(), self.region.epoch().version)
    }

    pub fn vector_status(&self) -> StoreResult<IndexStatus> {
        Ok(self.vector_holder()?.status())
    }

    pub fn vector_reset(&self, delete_data_file: bool) -> StoreResult<()> {
        let holder = self.vector_holder()?;
        let path = self.snapshot_path();
        holder.reset(delete_data_file.then_some(path.as_path()))
    }

    pub fn vector_dump(&self, dump_all: bool) -> StoreResult<Vec<String>> {
        self.region.check_serving()?;
        let holder = self.vector_holder()?;
        let ctx = self.vector_ctx(0);
        self.vreader.dump(&ctx, holder, dump_all)
    }

    /// Bulk apply of adds and deletes (snapshot install, load jobs).
    pub fn vector_import(
        &self,
        add: &[VectorWithId],
        delete: &[VectorId],
    ) -> StoreResult<()> {
        if !add.is_empty() {
            self.vector_add(add)?;
        }
        if !delete.is_empty() {
            self.vector_delete(delete)?;
        }
        Ok(())
    }

    /// Pairwise distance computation; no storage involved.
    pub fn vector_calc_distance(
        metric: Metric,
        left: &[Vec<f32>],
        right: &[Vec<f32>],
    ) -> StoreResult<Vec<Vec<f32>>> {
        calc_distance(metric, left, right)
    }

    // ==================================================================
    // Snapshot transfer
    // ==================================================================

    /// Export the data family as SSTs for snapshot transfer.
    pub fn checkpoint(&self, dir: &Path) -> StoreResult<Vec<SstFileMeta>> {
        self.region.check_serving()?;
        self.raw.checkpoint(dir, cf_names::DATA)
    }

    pub fn ingest(&self, cf: &str, files: &[PathBuf]) -> StoreResult<()> {
        self.region.check_writable()?;
        self.raw.ingest(cf, files)
    }
}
