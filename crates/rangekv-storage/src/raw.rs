//! Column-family-aware wrapper around the log-structured engine.
//!
//! One `RawStore` is opened per process and shared by every region. The
//! wrapper owns the shared block cache, resolves column family handles,
//! applies multi-CF write batches atomically, and exposes the checkpoint and
//! SST-ingest surface used for snapshot transfer.

use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use rocksdb::checkpoint::Checkpoint;
use rocksdb::{Cache, ColumnFamily, DBRawIterator, IngestExternalFileOptions, Options,
    ReadOptions, Snapshot, SstFileWriter, WriteBatch, DB};
use tracing::info;

use rangekv_core::config::RawConfig;
use rangekv_core::error::{StoreError, StoreResult};
use rangekv_core::types::{KeyValue, Range};

use crate::column_families::{cf_names, get_column_family_descriptors};

const LOCK_STRIPES: usize = 64;

fn engine_err(err: rocksdb::Error) -> StoreError {
    StoreError::Internal(format!("engine: {err}"))
}

/// Striped per-key mutex table.
///
/// Linearizes the read-modify-write operations (`compare_and_set`,
/// `put_if_absent`) and serializes transaction operations per row. Guards are
/// acquired in ascending stripe order so multi-key holders cannot deadlock.
pub struct KeyLockTable {
    stripes: Vec<Mutex<()>>,
}

impl KeyLockTable {
    fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe_of(&self, key: &[u8]) -> usize {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }

    /// Lock a single key.
    pub fn lock_key(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_of(key)].lock()
    }

    /// Lock a set of keys; stripes are deduplicated and taken in order.
    pub fn lock_keys<'a, I>(&self, keys: I) -> Vec<MutexGuard<'_, ()>>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut stripes: Vec<usize> = keys.into_iter().map(|k| self.stripe_of(k)).collect();
        stripes.sort_unstable();
        stripes.dedup();
        stripes.into_iter().map(|s| self.stripes[s].lock()).collect()
    }
}

/// A single atomic batch of puts/deletes across column families.
#[derive(Default)]
pub struct RawWriteBatch {
    ops: Vec<BatchOp>,
}

enum BatchOp {
    Put {
        cf: &'static str,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: &'static str,
        key: Vec<u8>,
    },
    DeleteRange {
        cf: &'static str,
        from: Vec<u8>,
        to: Vec<u8>,
    },
}

impl RawWriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, cf: &'static str, key: Vec<u8>, value: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Put { cf, key, value });
        self
    }

    pub fn delete(&mut self, cf: &'static str, key: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Delete { cf, key });
        self
    }

    pub fn delete_range(&mut self, cf: &'static str, from: Vec<u8>, to: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::DeleteRange { cf, from, to });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Iterator bounds. Both bounds apply to encoded keys.
#[derive(Debug, Clone, Default)]
pub struct IterOptions {
    pub lower_bound: Option<Vec<u8>>,
    pub upper_bound: Option<Vec<u8>>,
}

impl IterOptions {
    pub fn upper(upper: Vec<u8>) -> Self {
        Self {
            lower_bound: None,
            upper_bound: Some(upper),
        }
    }

    fn to_read_options(&self) -> ReadOptions {
        let mut opts = ReadOptions::default();
        // Region scans routinely cross prefix-extractor boundaries at the
        // timestamp suffix; total-order seek keeps them correct.
        opts.set_total_order_seek(true);
        if let Some(lower) = &self.lower_bound {
            opts.set_iterate_lower_bound(lower.clone());
        }
        if let Some(upper) = &self.upper_bound {
            opts.set_iterate_upper_bound(upper.clone());
        }
        opts
    }
}

/// Bounded raw iterator over one column family.
pub struct RawIter<'a> {
    inner: DBRawIterator<'a>,
}

impl RawIter<'_> {
    pub fn seek(&mut self, key: &[u8]) {
        self.inner.seek(key);
    }

    pub fn seek_for_prev(&mut self, key: &[u8]) {
        self.inner.seek_for_prev(key);
    }

    pub fn seek_to_first(&mut self) {
        self.inner.seek_to_first();
    }

    pub fn seek_to_last(&mut self) {
        self.inner.seek_to_last();
    }

    pub fn next(&mut self) {
        self.inner.next();
    }

    pub fn prev(&mut self) {
        self.inner.prev();
    }

    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    pub fn key(&self) -> &[u8] {
        self.inner.key().unwrap_or(&[])
    }

    pub fn value(&self) -> &[u8] {
        self.inner.value().unwrap_or(&[])
    }
}

/// A consistent point-in-time view used by multi-CF walks.
pub struct RawSnapshot<'a> {
    inner: Snapshot<'a>,
    store: &'a RawStore,
}

impl<'a> RawSnapshot<'a> {
    pub fn iter(&self, cf: &str, opts: IterOptions) -> StoreResult<RawIter<'_>> {
        let cf = self.store.cf(cf)?;
        Ok(RawIter {
            inner: self.inner.raw_iterator_cf_opt(cf, opts.to_read_options()),
        })
    }
}

/// Metadata of one exported SST file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SstFileMeta {
    pub cf: String,
    pub name: String,
    pub level: i32,
    pub size: usize,
    pub smallest: Vec<u8>,
    pub largest: Vec<u8>,
}

/// Process-wide engine handle.
///
/// Internally thread-safe: reads and writes go through `&self` and the
/// engine's own synchronization; share via `Arc<RawStore>`.
pub struct RawStore {
    db: DB,
    /// Shared block cache; kept alive for the lifetime of the DB.
    #[allow(dead_code)]
    cache: Cache,
    path: PathBuf,
    key_locks: KeyLockTable,
}

impl RawStore {
    /// Open (or create) the engine with every column family.
    pub fn open<P: AsRef<Path>>(path: P, config: &RawConfig) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let cache = Cache::new_lru_cache(config.block_cache_size as usize);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        if !config.enable_wal {
            db_opts.set_manual_wal_flush(true);
        }

        let descriptors = get_column_family_descriptors(&cache, config);
        let db = DB::open_cf_descriptors(&db_opts, &path, descriptors).map_err(|e| {
            StoreError::Internal(format!("open engine at {}: {e}", path.display()))
        })?;

        info!(path = %path.display(), "raw store opened");
        Ok(Self {
            db,
            cache,
            path,
            key_locks: KeyLockTable::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key_locks(&self) -> &KeyLockTable {
        &self.key_locks
    }

    fn cf(&self, name: &str) -> StoreResult<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Internal(format!("column family not found: {name}")))
    }

    /// Point read of an encoded key.
    pub fn get(&self, cf: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        if key.is_empty() {
            return Err(StoreError::KeyEmpty);
        }
        let cf = self.cf(cf)?;
        self.db.get_cf(cf, key).map_err(engine_err)
    }

    pub fn put(&self, cf: &str, key: &[u8], value: &[u8]) -> StoreResult<()> {
        if key.is_empty() {
            return Err(StoreError::KeyEmpty);
        }
        let cf = self.cf(cf)?;
        self.db.put_cf(cf, key, value).map_err(engine_err)
    }

    pub fn delete(&self, cf: &str, key: &[u8]) -> StoreResult<()> {
        if key.is_empty() {
            return Err(StoreError::KeyEmpty);
        }
        let cf = self.cf(cf)?;
        self.db.delete_cf(cf, key).map_err(engine_err)
    }

    /// Apply a multi-CF batch atomically.
    pub fn write(&self, batch: RawWriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut inner = WriteBatch::default();
        for op in &batch.ops {
            match op {
                BatchOp::Put { cf, key, value } => inner.put_cf(self.cf(cf)?, key, value),
                BatchOp::Delete { cf, key } => inner.delete_cf(self.cf(cf)?, key),
                BatchOp::DeleteRange { cf, from, to } => {
                    inner.delete_range_cf(self.cf(cf)?, from, to)
                }
            }
        }
        self.db.write(inner).map_err(engine_err)
    }

    /// Physical range delete over encoded bounds of one family.
    pub fn delete_range(&self, cf: &str, range: &Range) -> StoreResult<()> {
        if range.is_empty() {
            return Ok(());
        }
        let cf = self.cf(cf)?;
        self.db
            .delete_range_cf(cf, &range.start_key, &range.end_key)
            .map_err(engine_err)
    }

    /// Linearizable compare-and-set on one encoded key.
    ///
    /// `expected = None` means "key must be absent"; `new = None` deletes.
    /// Returns false (and performs no write) when the current value differs
    /// from `expected`.
    pub fn compare_and_set(
        &self,
        cf: &str,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> StoreResult<bool> {
        if key.is_empty() {
            return Err(StoreError::KeyEmpty);
        }
        let _guard = self.key_locks.lock_key(key);
        let current = self.get(cf, key)?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        match new {
            Some(value) => self.put(cf, key, value)?,
            None => self.delete(cf, key)?,
        }
        Ok(true)
    }

    /// Linearizable put-if-absent. Returns false when the key already exists.
    pub fn put_if_absent(&self, cf: &str, key: &[u8], value: &[u8]) -> StoreResult<bool> {
        self.compare_and_set(cf, key, None, Some(value))
    }

    pub fn snapshot(&self) -> RawSnapshot<'_> {
        RawSnapshot {
            inner: self.db.snapshot(),
            store: self,
        }
    }

    /// Bounded raw iterator over one family.
    pub fn iter(&self, cf: &str, opts: IterOptions) -> StoreResult<RawIter<'_>> {
        let cf = self.cf(cf)?;
        Ok(RawIter {
            inner: self.db.raw_iterator_cf_opt(cf, opts.to_read_options()),
        })
    }

    /// Collect up to `limit` raw entries of `[start, end)` (encoded bounds).
    pub fn scan(
        &self,
        cf: &str,
        range: &Range,
        limit: usize,
    ) -> StoreResult<Vec<KeyValue>> {
        let mut opts = IterOptions::default();
        if !range.end_key.is_empty() {
            opts.upper_bound = Some(range.end_key.clone());
        }
        let mut iter = self.iter(cf, opts)?;
        iter.seek(&range.start_key);
        let mut out = Vec::new();
        while iter.valid() && (limit == 0 || out.len() < limit) {
            out.push(KeyValue::new(iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        Ok(out)
    }

    /// Export an SST-level snapshot of the whole engine into `dir` and return
    /// the per-file metadata of `cf`'s live files.
    pub fn checkpoint(&self, dir: &Path, cf: &str) -> StoreResult<Vec<SstFileMeta>> {
        let checkpoint = Checkpoint::new(&self.db).map_err(engine_err)?;
        checkpoint.create_checkpoint(dir).map_err(engine_err)?;

        let files = self.db.live_files().map_err(engine_err)?;
        let metas = files
            .into_iter()
            .filter(|f| f.column_family_name == cf)
            .map(|f| SstFileMeta {
                cf: f.column_family_name,
                name: f.name,
                level: f.level,
                size: f.size,
                smallest: f.start_key.unwrap_or_default(),
                largest: f.end_key.unwrap_or_default(),
            })
            .collect();
        Ok(metas)
    }

    /// Hard-link external SST files into a family.
    pub fn ingest(&self, cf: &str, files: &[PathBuf]) -> StoreResult<()> {
        if files.is_empty() {
            return Ok(());
        }
        let cf = self.cf(cf)?;
        let mut opts = IngestExternalFileOptions::default();
        opts.set_move_files(true);
        self.db
            .ingest_external_file_cf_opts(cf, &opts, files.to_vec())
            .map_err(engine_err)
    }

    /// Estimated live data size of one family. Used as the split pre-check
    /// floor; not byte-accurate.
    pub fn approximate_size(&self, cf: &str) -> StoreResult<u64> {
        let cf = self.cf(cf)?;
        let size = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-live-data-size")
            .map_err(engine_err)?
            .unwrap_or(0);
        Ok(size)
    }

    pub fn flush_all(&self) -> StoreResult<()> {
        for name in cf_names::ALL {
            let cf = self.cf(name)?;
            self.db.flush_cf(cf).map_err(engine_err)?;
        }
        Ok(())
    }
}

/// Write `entries` (sorted in target-family order, unique) into an SST file
/// suitable for [`RawStore::ingest`]. `versioned` must match the target
/// family so the file carries the right comparator.
pub fn build_sst_file(path: &Path, entries: &[KeyValue], versioned: bool) -> StoreResult<()> {
    let opts = if versioned {
        crate::column_families::versioned_sst_options()
    } else {
        Options::default()
    };
    let mut writer = SstFileWriter::create(&opts);
    writer.open(path).map_err(engine_err)?;
    for entry in entries {
        writer.put(&entry.key, &entry.value).map_err(engine_err)?;
    }
    writer.finish().map_err(engine_err)
}
