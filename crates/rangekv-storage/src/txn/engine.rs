//! Percolator-style transaction engine.
//!
//! Two-phase commit with optional pessimistic row locks. Operations are
//! serialized per key through the raw store's striped row locks (taken in
//! sorted stripe order) and applied through one atomic write batch each, so
//! a crash never leaves a partially applied operation.

use std::sync::Arc;

use tracing::{debug, info, warn};

use rangekv_core::codec::{self, append_ts};
use rangekv_core::error::{StoreError, StoreResult};
use rangekv_core::types::{next_key, KeyValue, OpContext, Range};

use crate::column_families::cf_names;
use crate::raw::{IterOptions, RawStore, RawWriteBatch};
use crate::txn::record::{
    lock_key, LockKind, LockRecord, Mutation, MutationOp, TxnStatus, WriteKind, WriteRecord,
};

/// Prewrite request. Field meanings follow the 2PC protocol: `mutations[i]`
/// is covered by a prior pessimistic lock when `pessimistic_checks[i]` is
/// true (the conflict check already happened at lock time).
#[derive(Debug, Clone, Default)]
pub struct PrewriteRequest {
    pub mutations: Vec<Mutation>,
    pub primary: Vec<u8>,
    pub start_ts: i64,
    pub lock_ttl_ms: i64,
    pub pessimistic_checks: Vec<bool>,
    pub for_update_ts: i64,
    pub min_commit_ts: i64,
    pub max_commit_ts: i64,
    pub try_one_pc: bool,
    pub secondaries: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrewriteResult {
    /// Non-zero when the transaction was committed in one phase.
    pub one_pc_commit_ts: i64,
}

/// Result of check-secondary-locks.
#[derive(Debug, Clone, Default)]
pub struct SecondaryLocksStatus {
    pub locks: Vec<(Vec<u8>, LockRecord)>,
    /// Non-zero when a secondary was found already committed.
    pub commit_ts: i64,
}

/// Full dump of the transaction families inside a range (diagnostics).
#[derive(Debug, Clone, Default)]
pub struct TxnDump {
    pub locks: Vec<(Vec<u8>, LockRecord)>,
    pub writes: Vec<(Vec<u8>, i64, WriteRecord)>,
    pub datas: Vec<(Vec<u8>, i64, Vec<u8>)>,
}

pub struct TxnEngine {
    store: Arc<RawStore>,
}

impl TxnEngine {
    pub fn new(store: Arc<RawStore>) -> Self {
        Self { store }
    }

    fn get_lock(&self, key: &[u8]) -> StoreResult<Option<LockRecord>> {
        match self.store.get(cf_names::LOCK, &lock_key(key))? {
            Some(raw) => Ok(Some(LockRecord::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Newest write record of `key` with `commit_ts <= ts` (`ts = i64::MAX`
    /// for the newest overall).
    fn seek_write(&self, key: &[u8], ts: i64) -> StoreResult<Option<(i64, WriteRecord)>> {
        let upper = append_ts(&next_key(key), i64::MAX);
        let mut iter = self.store.iter(cf_names::WRITE, IterOptions::upper(upper))?;
        iter.seek(&append_ts(key, ts));
        if !iter.valid() {
            return Ok(None);
        }
        let (plain, commit_ts) = codec::split_encoded(iter.key())?;
        if plain != key {
            return Ok(None);
        }
        Ok(Some((commit_ts, WriteRecord::decode(iter.value())?)))
    }

    /// Find the write record produced by `start_ts`, scanning versions
    /// newest-first.
    fn find_write_by_start_ts(
        &self,
        key: &[u8],
        start_ts: i64,
    ) -> StoreResult<Option<(i64, WriteRecord)>> {
        let upper = append_ts(&next_key(key), i64::MAX);
        let mut iter = self.store.iter(cf_names::WRITE, IterOptions::upper(upper))?;
        iter.seek(&append_ts(key, i64::MAX));
        while iter.valid() {
            let (plain, commit_ts) = codec::split_encoded(iter.key())?;
            if plain != key {
                break;
            }
            // Records are keyed by commit_ts >= start_ts; stop early once
            // past the candidate window.
            if commit_ts < start_ts {
                break;
            }
            let record = WriteRecord::decode(iter.value())?;
            if record.start_ts == start_ts {
                return Ok(Some((commit_ts, record)));
            }
            iter.next();
        }
        Ok(None)
    }

    /// Acquire pessimistic locks on `keys`.
    pub fn pessimistic_lock(
        &self,
        keys: &[Vec<u8>],
        primary: &[u8],
        start_ts: i64,
        for_update_ts: i64,
        ttl_ms: i64,
    ) -> StoreResult<()> {
        let _guards = self
            .store
            .key_locks()
            .lock_keys(keys.iter().map(|k| k.as_slice()));

        let mut batch = RawWriteBatch::new();
        for key in keys {
            if key.is_empty() {
                return Err(StoreError::KeyEmpty);
            }
            match self.get_lock(key)? {
                Some(lock) if lock.start_ts != start_ts => {
                    return Err(StoreError::KeyIsLocked {
                        key: key.clone(),
                        lock_ts: lock.start_ts,
                    });
                }
                Some(lock) if lock.for_update_ts >= for_update_ts => {
                    // Already held at an equal or newer for_update_ts.
                    continue;
                }
                _ => {}
            }
            if let Some((conflict_ts, _)) = self.seek_write(key, i64::MAX)? {
                if conflict_ts > for_update_ts {
                    return Err(StoreError::WriteConflict {
                        key: key.clone(),
                        start_ts,
                        conflict_ts,
                    });
                }
            }
            let lock = LockRecord {
                primary: primary.to_vec(),
                start_ts,
                ttl_ms,
                for_update_ts,
                kind: LockKind::Pessimistic,
                secondaries: Vec::new(),
            };
            batch.put(cf_names::LOCK, lock_key(key), lock.encode());
        }
        self.store.write(batch)
    }

    /// Release pessimistic locks that never reached prewrite.
    pub fn pessimistic_rollback(
        &self,
        keys: &[Vec<u8>],
        start_ts: i64,
        for_update_ts: i64,
    ) -> StoreResult<()> {
        let _guards = self
            .store
            .key_locks()
            .lock_keys(keys.iter().map(|k| k.as_slice()));

        let mut batch = RawWriteBatch::new();
        for key in keys {
            if let Some(lock) = self.get_lock(key)? {
                if lock.kind == LockKind::Pessimistic
                    && lock.start_ts == start_ts
                    && lock.for_update_ts <= for_update_ts
                {
                    batch.delete(cf_names::LOCK, lock_key(key));
                }
            }
        }
        self.store.write(batch)
    }

    pub fn prewrite(&self, req: PrewriteRequest) -> StoreResult<PrewriteResult> {
        if req.mutations.is_empty() {
            return Ok(PrewriteResult::default());
        }
        let _guards = self
            .store
            .key_locks()
            .lock_keys(req.mutations.iter().map(|m| m.key.as_slice()));

        // Validation pass: every mutation must be clean before anything is
        // written.
        for (idx, mutation) in req.mutations.iter().enumerate() {
            if mutation.key.is_empty() {
                return Err(StoreError::KeyEmpty);
            }
            let pessimistic = req.pessimistic_checks.get(idx).copied().unwrap_or(false);

            match self.get_lock(&mutation.key)? {
                Some(lock) if lock.start_ts != req.start_ts => {
                    return Err(StoreError::KeyIsLocked {
                        key: mutation.key.clone(),
                        lock_ts: lock.start_ts,
                    });
                }
                Some(_) => {}
                None if pessimistic => {
                    // The pessimistic lock we rely on is gone (expired and
                    // resolved away).
                    return Err(StoreError::LockNotFound {
                        key: mutation.key.clone(),
                        start_ts: req.start_ts,
                    });
                }
                None => {}
            }

            if let Some((conflict_ts, record)) = self.seek_write(&mutation.key, i64::MAX)? {
                // A rollback of this very transaction wins over a late
                // prewrite.
                if record.kind == WriteKind::Rollback && record.start_ts == req.start_ts {
                    return Err(StoreError::WriteConflict {
                        key: mutation.key.clone(),
                        start_ts: req.start_ts,
                        conflict_ts,
                    });
                }
                if !pessimistic && conflict_ts > req.start_ts {
                    return Err(StoreError::WriteConflict {
                        key: mutation.key.clone(),
                        start_ts: req.start_ts,
                        conflict_ts,
                    });
                }
            }
        }

        if req.try_one_pc {
            if let Some(result) = self.try_commit_one_pc(&req)? {
                return Ok(result);
            }
            debug!(start_ts = req.start_ts, "one-pc window closed, falling back to 2pc");
        }

        let mut batch = RawWriteBatch::new();
        for mutation in &req.mutations {
            let lock = LockRecord {
                primary: req.primary.clone(),
                start_ts: req.start_ts,
                ttl_ms: req.lock_ttl_ms,
                for_update_ts: req.for_update_ts,
                kind: mutation.lock_kind(),
                secondaries: if mutation.key == req.primary {
                    req.secondaries.clone()
                } else {
                    Vec::new()
                },
            };
            batch.put(cf_names::LOCK, lock_key(&mutation.key), lock.encode());
            if mutation.op == MutationOp::Put {
                batch.put(
                    cf_names::DATA,
                    append_ts(&mutation.key, req.start_ts),
                    codec::pack_value(codec::FLAG_NONE, &mutation.value),
                );
            }
        }
        self.store.write(batch)?;
        Ok(PrewriteResult::default())
    }

    /// Attempt the one-phase commit path; returns `None` when the commit
    /// timestamp window does not allow it.
    fn try_commit_one_pc(&self, req: &PrewriteRequest) -> StoreResult<Option<PrewriteResult>> {
        let commit_ts = req.min_commit_ts.max(req.start_ts + 1);
        if req.max_commit_ts > 0 && commit_ts > req.max_commit_ts {
            return Ok(None);
        }
        let mut batch = RawWriteBatch::new();
        for mutation in &req.mutations {
            let record = WriteRecord::new(req.start_ts, mutation.write_kind());
            batch.put(
                cf_names::WRITE,
                append_ts(&mutation.key, commit_ts),
                record.encode(),
            );
            if mutation.op == MutationOp::Put {
                batch.put(
                    cf_names::DATA,
                    append_ts(&mutation.key, req.start_ts),
                    codec::pack_value(codec::FLAG_NONE, &mutation.value),
                );
            }
        }
        self.store.write(batch)?;
        info!(start_ts = req.start_ts, commit_ts, "transaction committed in one phase");
        Ok(Some(PrewriteResult {
            one_pc_commit_ts: commit_ts,
        }))
    }

    pub fn commit(&self, keys: &[Vec<u8>], start_ts: i64, commit_ts: i64) -> StoreResult<()> {
        if commit_ts <= start_ts {
            return Err(StoreError::Internal(format!(
                "commit_ts {commit_ts} must exceed start_ts {start_ts}"
            )));
        }
        let _guards = self
            .store
            .key_locks()
            .lock_keys(keys.iter().map(|k| k.as_slice()));

        let mut batch = RawWriteBatch::new();
        for key in keys {
            match self.get_lock(key)? {
                Some(lock) if lock.start_ts == start_ts => {
                    let kind = match lock.kind {
                        LockKind::Put => WriteKind::Put,
                        LockKind::Delete => WriteKind::Delete,
                        LockKind::Optimistic | LockKind::Pessimistic => WriteKind::Lock,
                    };
                    batch.put(
                        cf_names::WRITE,
                        append_ts(key, commit_ts),
                        WriteRecord::new(start_ts, kind).encode(),
                    );
                    batch.delete(cf_names::LOCK, lock_key(key));
                }
                _ => match self.find_write_by_start_ts(key, start_ts)? {
                    // Already committed; commit is idempotent.
                    Some((_, record)) if record.kind != WriteKind::Rollback => {}
                    _ => {
                        return Err(StoreError::TxnNotFound { start_ts });
                    }
                },
            }
        }
        self.store.write(batch)
    }

    pub fn batch_rollback(&self, keys: &[Vec<u8>], start_ts: i64) -> StoreResult<()> {
        let _guards = self
            .store
            .key_locks()
            .lock_keys(keys.iter().map(|k| k.as_slice()));

        let mut batch = RawWriteBatch::new();
        for key in keys {
            if let Some((commit_ts, record)) = self.find_write_by_start_ts(key, start_ts)? {
                if record.kind == WriteKind::Rollback {
                    continue; // already rolled back
                }
                return Err(StoreError::WriteConflict {
                    key: key.clone(),
                    start_ts,
                    conflict_ts: commit_ts,
                });
            }
            if let Some(lock) = self.get_lock(key)? {
                if lock.start_ts == start_ts {
                    batch.delete(cf_names::LOCK, lock_key(key));
                    batch.delete(cf_names::DATA, append_ts(key, start_ts));
                }
            }
            // The rollback tombstone blocks a late prewrite at start_ts.
            batch.put(
                cf_names::WRITE,
                append_ts(key, start_ts),
                WriteRecord::new(start_ts, WriteKind::Rollback).encode(),
            );
        }
        self.store.write(batch)
    }

    /// Commit (`commit_ts > 0`) or roll back every lock of `start_ts`.
    /// With an empty key list the whole `range` is scanned for matching
    /// locks.
    pub fn resolve_lock(
        &self,
        range: &Range,
        start_ts: i64,
        commit_ts: i64,
        keys: &[Vec<u8>],
    ) -> StoreResult<()> {
        let keys: Vec<Vec<u8>> = if keys.is_empty() {
            self.scan_lock(range, 0, 0)?
                .into_iter()
                .filter(|(_, lock)| lock.start_ts == start_ts)
                .map(|(key, _)| key)
                .collect()
        } else {
            keys.to_vec()
        };
        if keys.is_empty() {
            return Ok(());
        }
        if commit_ts > 0 {
            self.commit(&keys, start_ts, commit_ts)
        } else {
            self.batch_rollback(&keys, start_ts)
        }
    }

    /// Determine the fate of a transaction from its primary lock.
    pub fn check_txn_status(
        &self,
        primary: &[u8],
        lock_ts: i64,
        caller_start_ts: i64,
        current_ts: i64,
    ) -> StoreResult<TxnStatus> {
        let _guard = self.store.key_locks().lock_key(primary);

        if let Some(lock) = self.get_lock(primary)? {
            if lock.start_ts == lock_ts {
                if lock.is_expired(current_ts) {
                    drop(_guard);
                    self.batch_rollback(&[primary.to_vec()], lock_ts)?;
                    info!(lock_ts, caller_start_ts, "expired primary lock rolled back");
                    return Ok(TxnStatus::LockExpired);
                }
                return Ok(TxnStatus::Locked {
                    ttl_ms: lock.ttl_ms,
                });
            }
        }

        match self.find_write_by_start_ts(primary, lock_ts)? {
            Some((commit_ts, record)) if record.kind != WriteKind::Rollback => {
                Ok(TxnStatus::Committed { commit_ts })
            }
            Some(_) => Ok(TxnStatus::RolledBack),
            None => {
                // Neither lock nor outcome: the prewrite never arrived.
                // Leave a rollback tombstone so it never can.
                drop(_guard);
                self.batch_rollback(&[primary.to_vec()], lock_ts)?;
                Ok(TxnStatus::RolledBack)
            }
        }
    }

    /// Inspect secondary keys of an async-commit transaction.
    pub fn check_secondary_locks(
        &self,
        keys: &[Vec<u8>],
        start_ts: i64,
    ) -> StoreResult<SecondaryLocksStatus> {
        let mut status = SecondaryLocksStatus::default();
        for key in keys {
            if let Some(lock) = self.get_lock(key)? {
                if lock.start_ts == start_ts {
                    status.locks.push((key.clone(), lock));
                    continue;
                }
            }
            match self.find_write_by_start_ts(key, start_ts)? {
                Some((commit_ts, record)) if record.kind != WriteKind::Rollback => {
                    status.commit_ts = status.commit_ts.max(commit_ts);
                }
                _ => {}
            }
        }
        Ok(status)
    }

    /// Extend a lock's TTL; returns the TTL now in force.
    pub fn heartbeat(&self, primary: &[u8], start_ts: i64, advise_ttl_ms: i64) -> StoreResult<i64> {
        let _guard = self.store.key_locks().lock_key(primary);
        let Some(mut lock) = self.get_lock(primary)? else {
            return Err(StoreError::TxnNotFound { start_ts });
        };
        if lock.start_ts != start_ts {
            return Err(StoreError::TxnNotFound { start_ts });
        }
        lock.ttl_ms = lock.ttl_ms.max(advise_ttl_ms);
        self.store.put(cf_names::LOCK, &lock_key(primary), &lock.encode())?;
        Ok(lock.ttl_ms)
    }

    /// Committed value of `key` at `ts`.
    pub fn get(&self, key: &[u8], ts: i64) -> StoreResult<Option<Vec<u8>>> {
        if let Some(lock) = self.get_lock(key)? {
            if lock.blocks_read(if ts == 0 { i64::MAX } else { ts }) {
                return Err(StoreError::KeyIsLocked {
                    key: key.to_vec(),
                    lock_ts: lock.start_ts,
                });
            }
        }
        self.get_committed(key, ts)
    }

    fn get_committed(&self, key: &[u8], ts: i64) -> StoreResult<Option<Vec<u8>>> {
        let read_ts = if ts == 0 { i64::MAX } else { ts };
        let upper = append_ts(&next_key(key), i64::MAX);
        let mut iter = self.store.iter(cf_names::WRITE, IterOptions::upper(upper))?;
        iter.seek(&append_ts(key, read_ts));
        while iter.valid() {
            let (plain, _) = codec::split_encoded(iter.key())?;
            if plain != key {
                break;
            }
            let record = WriteRecord::decode(iter.value())?;
            match record.kind {
                WriteKind::Put => {
                    let raw = self
                        .store
                        .get(cf_names::DATA, &append_ts(key, record.start_ts))?
                        .ok_or_else(|| StoreError::Corruption {
                            location: "txn data".to_string(),
                            details: format!(
                                "write record at start_ts {} has no data",
                                record.start_ts
                            ),
                        })?;
                    return Ok(Some(codec::unpack_value(&raw)?.payload.to_vec()));
                }
                WriteKind::Delete => return Ok(None),
                WriteKind::Rollback | WriteKind::Lock => iter.next(),
            }
        }
        Ok(None)
    }

    /// Snapshot scan over committed values. Fails with `KeyIsLocked` when a
    /// blocking lock overlaps the range at `ts`.
    pub fn scan(
        &self,
        range: &Range,
        ts: i64,
        limit: usize,
        key_only: bool,
        ctx: &OpContext,
    ) -> StoreResult<Vec<KeyValue>> {
        let read_ts = if ts == 0 { i64::MAX } else { ts };
        for (key, lock) in self.scan_lock(range, 0, 0)? {
            if lock.blocks_read(read_ts) {
                return Err(StoreError::KeyIsLocked {
                    key,
                    lock_ts: lock.start_ts,
                });
            }
        }

        let encoded = codec::encode_range(range);
        let mut opts = IterOptions::default();
        if !encoded.end_key.is_empty() {
            opts.upper_bound = Some(encoded.end_key.clone());
        }
        let mut iter = self.store.iter(cf_names::WRITE, opts)?;
        iter.seek(&encoded.start_key);

        let mut out: Vec<KeyValue> = Vec::new();
        let mut current: Option<Vec<u8>> = None;
        let mut decided = false;
        while iter.valid() {
            ctx.check()?;
            let (plain, commit_ts) = codec::split_encoded(iter.key())?;
            if current.as_deref() != Some(plain) {
                current = Some(plain.to_vec());
                decided = false;
            }
            if decided || commit_ts > read_ts {
                iter.next();
                continue;
            }
            let record = WriteRecord::decode(iter.value())?;
            match record.kind {
                WriteKind::Put => {
                    let key = plain.to_vec();
                    let value = if key_only {
                        Vec::new()
                    } else {
                        let raw = self
                            .store
                            .get(cf_names::DATA, &append_ts(&key, record.start_ts))?
                            .ok_or_else(|| StoreError::Corruption {
                                location: "txn data".to_string(),
                                details: format!(
                                    "write record at start_ts {} has no data",
                                    record.start_ts
                                ),
                            })?;
                        codec::unpack_value(&raw)?.payload.to_vec()
                    };
                    out.push(KeyValue::new(key, value));
                    decided = true;
                    if limit > 0 && out.len() >= limit {
                        break;
                    }
                }
                WriteKind::Delete => decided = true,
                WriteKind::Rollback | WriteKind::Lock => {}
            }
            iter.next();
        }
        Ok(out)
    }

    /// Locks inside `range` with `start_ts <= max_ts` (`max_ts = 0` for
    /// all). Returned keys are plain keys.
    pub fn scan_lock(
        &self,
        range: &Range,
        max_ts: i64,
        limit: usize,
    ) -> StoreResult<Vec<(Vec<u8>, LockRecord)>> {
        let encoded = codec::encode_range(range);
        let mut opts = IterOptions::default();
        if !encoded.end_key.is_empty() {
            opts.upper_bound = Some(encoded.end_key.clone());
        }
        let mut iter = self.store.iter(cf_names::LOCK, opts)?;
        iter.seek(&encoded.start_key);
        let mut out = Vec::new();
        while iter.valid() && (limit == 0 || out.len() < limit) {
            let (plain, _) = codec::split_encoded(iter.key())?;
            let lock = LockRecord::decode(iter.value())?;
            if max_ts == 0 || lock.start_ts <= max_ts {
                out.push((plain.to_vec(), lock));
            }
            iter.next();
        }
        Ok(out)
    }

    /// Drop every committed version older than `safe_point_ts`, keeping the
    /// newest visible `Put` per key. Rollback and lock markers at or below
    /// the safe point are dropped wholesale.
    pub fn gc(&self, range: &Range, safe_point_ts: i64, ctx: &OpContext) -> StoreResult<u64> {
        let encoded = codec::encode_range(range);
        let mut opts = IterOptions::default();
        if !encoded.end_key.is_empty() {
            opts.upper_bound = Some(encoded.end_key.clone());
        }
        let mut iter = self.store.iter(cf_names::WRITE, opts)?;
        iter.seek(&encoded.start_key);

        let mut removed = 0u64;
        let mut batch = RawWriteBatch::new();
        let mut current: Option<Vec<u8>> = None;
        let mut kept_visible = false;
        while iter.valid() {
            ctx.check()?;
            let (plain, commit_ts) = codec::split_encoded(iter.key())?;
            if current.as_deref() != Some(plain) {
                current = Some(plain.to_vec());
                kept_visible = false;
            }
            if commit_ts > safe_point_ts {
                iter.next();
                continue;
            }
            let record = WriteRecord::decode(iter.value())?;
            let key = plain.to_vec();
            let drop_record = match record.kind {
                WriteKind::Put if !kept_visible => {
                    // Newest visible version at the safe point survives.
                    kept_visible = true;
                    false
                }
                WriteKind::Delete if !kept_visible => {
                    // A tombstone at the top is itself collectable.
                    kept_visible = true;
                    true
                }
                WriteKind::Rollback | WriteKind::Lock => true,
                _ => true,
            };
            if drop_record {
                batch.delete(cf_names::WRITE, append_ts(&key, commit_ts));
                if record.references_data() {
                    batch.delete(cf_names::DATA, append_ts(&key, record.start_ts));
                }
                removed += 1;
            }
            if batch.len() >= 512 {
                self.store.write(std::mem::take(&mut batch))?;
            }
            iter.next();
        }
        self.store.write(batch)?;
        if removed > 0 {
            info!(safe_point_ts, removed, "txn gc finished");
        }
        Ok(removed)
    }

    /// Non-transactional purge of every family inside the range. Admin
    /// operation; concurrent transactions see it as data loss.
    pub fn delete_range(&self, range: &Range) -> StoreResult<()> {
        if range.is_empty() {
            return Ok(());
        }
        warn!(
            start = ?range.start_key,
            end = ?range.end_key,
            "txn delete-range purges committed history"
        );
        let encoded = codec::encode_range(range);
        self.store.delete_range(cf_names::DATA, &encoded)?;
        self.store.delete_range(cf_names::WRITE, &encoded)?;
        self.store.delete_range(cf_names::LOCK, &encoded)?;
        Ok(())
    }

    /// Dump locks, write records and data versions of a range.
    pub fn dump(&self, range: &Range) -> StoreResult<TxnDump> {
        let mut dump = TxnDump {
            locks: self.scan_lock(range, 0, 0)?,
            ..Default::default()
        };

        let encoded = codec::encode_range(range);
        let mut opts = IterOptions::default();
        if !encoded.end_key.is_empty() {
            opts.upper_bound = Some(encoded.end_key.clone());
        }
        let mut iter = self.store.iter(cf_names::WRITE, opts.clone())?;
        iter.seek(&encoded.start_key);
        while iter.valid() {
            let (plain, commit_ts) = codec::split_encoded(iter.key())?;
            dump.writes
                .push((plain.to_vec(), commit_ts, WriteRecord::decode(iter.value())?));
            iter.next();
        }

        let mut iter = self.store.iter(cf_names::DATA, opts)?;
        iter.seek(&encoded.start_key);
        while iter.valid() {
            let (plain, start_ts) = codec::split_encoded(iter.key())?;
            let value = codec::unpack_value(iter.value())?.payload.to_vec();
            dump.datas.push((plain.to_vec(), start_ts, value));
            iter.next();
        }
        Ok(dump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangekv_core::codec::{encode_plain_key, TXN_PREFIX};
    use rangekv_core::config::RawConfig;
    use tempfile::TempDir;

    fn plain(user: &[u8]) -> Vec<u8> {
        encode_plain_key(TXN_PREFIX, 1, user)
    }

    fn region_range() -> Range {
        Range::new(plain(b""), encode_plain_key(TXN_PREFIX, 2, b""))
    }

    fn open() -> (TempDir, TxnEngine) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(RawStore::open(tmp.path(), &RawConfig::default()).unwrap());
        (tmp, TxnEngine::new(store))
    }

    fn prewrite_two(engine: &TxnEngine, start_ts: i64) {
        engine
            .prewrite(PrewriteRequest {
                mutations: vec![
                    Mutation::put(plain(b"x"), b"1".to_vec()),
                    Mutation::put(plain(b"y"), b"2".to_vec()),
                ],
                primary: plain(b"x"),
                start_ts,
                lock_ttl_ms: 1000,
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn test_two_phase_commit_happy_path() {
        let (_tmp, engine) = open();
        prewrite_two(&engine, 10);

        // Reads at or after start_ts hit the lock.
        assert!(matches!(
            engine.get(&plain(b"x"), 10),
            Err(StoreError::KeyIsLocked { .. })
        ));
        // Reads before the lock's start_ts pass through.
        assert_eq!(engine.get(&plain(b"x"), 9).unwrap(), None);

        engine
            .commit(&[plain(b"x"), plain(b"y")], 10, 11)
            .unwrap();
        assert_eq!(engine.get(&plain(b"x"), 11).unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(&plain(b"y"), 11).unwrap(), Some(b"2".to_vec()));
        assert_eq!(engine.get(&plain(b"x"), 10).unwrap(), None);

        // No lock survives a successful commit.
        assert!(engine.scan_lock(&region_range(), 0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_prewrite_conflicts() {
        let (_tmp, engine) = open();
        prewrite_two(&engine, 10);

        // Another txn touching a locked key is rejected.
        let err = engine
            .prewrite(PrewriteRequest {
                mutations: vec![Mutation::put(plain(b"x"), b"other".to_vec())],
                primary: plain(b"x"),
                start_ts: 12,
                lock_ttl_ms: 1000,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::KeyIsLocked { lock_ts: 10, .. }));

        engine.commit(&[plain(b"x"), plain(b"y")], 10, 11).unwrap();

        // A txn that started before the commit now sees a write conflict.
        let err = engine
            .prewrite(PrewriteRequest {
                mutations: vec![Mutation::put(plain(b"x"), b"stale".to_vec())],
                primary: plain(b"x"),
                start_ts: 10,
                lock_ttl_ms: 1000,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::WriteConflict { conflict_ts: 11, .. }));
    }

    #[test]
    fn test_rollback_leaves_no_trace() {
        let (_tmp, engine) = open();
        prewrite_two(&engine, 20);
        engine
            .batch_rollback(&[plain(b"x"), plain(b"y")], 20)
            .unwrap();

        assert!(engine.scan_lock(&region_range(), 0, 0).unwrap().is_empty());
        assert_eq!(engine.get(&plain(b"x"), 100).unwrap(), None);

        // A late prewrite at the rolled-back start_ts is refused.
        let err = engine
            .prewrite(PrewriteRequest {
                mutations: vec![Mutation::put(plain(b"x"), b"late".to_vec())],
                primary: plain(b"x"),
                start_ts: 20,
                lock_ttl_ms: 1000,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::WriteConflict { .. }));

        // Commit after rollback reports the txn gone.
        let err = engine.commit(&[plain(b"x")], 20, 25).unwrap_err();
        assert!(matches!(err, StoreError::TxnNotFound { start_ts: 20 }));
    }

    #[test]
    fn test_commit_is_idempotent() {
        let (_tmp, engine) = open();
        prewrite_two(&engine, 10);
        engine.commit(&[plain(b"x"), plain(b"y")], 10, 11).unwrap();
        engine.commit(&[plain(b"x"), plain(b"y")], 10, 11).unwrap();
        assert_eq!(engine.get(&plain(b"x"), 11).unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_pessimistic_lock_conflict_and_retry() {
        let (_tmp, engine) = open();

        // Txn A locks k.
        engine
            .pessimistic_lock(&[plain(b"k")], &plain(b"k"), 10, 10, 1000)
            .unwrap();
        // Txn B is refused.
        let err = engine
            .pessimistic_lock(&[plain(b"k")], &plain(b"k"), 11, 11, 1000)
            .unwrap_err();
        assert!(matches!(err, StoreError::KeyIsLocked { lock_ts: 10, .. }));

        // A prewrites and commits.
        engine
            .prewrite(PrewriteRequest {
                mutations: vec![Mutation::put(plain(b"k"), b"a".to_vec())],
                primary: plain(b"k"),
                start_ts: 10,
                lock_ttl_ms: 1000,
                pessimistic_checks: vec![true],
                for_update_ts: 10,
                ..Default::default()
            })
            .unwrap();
        engine.commit(&[plain(b"k")], 10, 12).unwrap();

        // B retries with a newer for_update_ts and succeeds.
        engine
            .pessimistic_lock(&[plain(b"k")], &plain(b"k"), 11, 13, 1000)
            .unwrap();
        // An older for_update_ts would have conflicted.
        engine.pessimistic_rollback(&[plain(b"k")], 11, 13).unwrap();
        let err = engine
            .pessimistic_lock(&[plain(b"k")], &plain(b"k"), 11, 11, 1000)
            .unwrap_err();
        assert!(matches!(err, StoreError::WriteConflict { conflict_ts: 12, .. }));
    }

    #[test]
    fn test_one_pc() {
        let (_tmp, engine) = open();
        let result = engine
            .prewrite(PrewriteRequest {
                mutations: vec![Mutation::put(plain(b"k"), b"v".to_vec())],
                primary: plain(b"k"),
                start_ts: 30,
                lock_ttl_ms: 1000,
                try_one_pc: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(result.one_pc_commit_ts, 31);
        assert!(engine.scan_lock(&region_range(), 0, 0).unwrap().is_empty());
        assert_eq!(engine.get(&plain(b"k"), 31).unwrap(), Some(b"v".to_vec()));

        // A closed commit window falls back to the 2PC path.
        let result = engine
            .prewrite(PrewriteRequest {
                mutations: vec![Mutation::put(plain(b"k2"), b"v".to_vec())],
                primary: plain(b"k2"),
                start_ts: 40,
                lock_ttl_ms: 1000,
                try_one_pc: true,
                min_commit_ts: 100,
                max_commit_ts: 50,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(result.one_pc_commit_ts, 0);
        assert_eq!(engine.scan_lock(&region_range(), 0, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_check_txn_status() {
        let (_tmp, engine) = open();
        prewrite_two(&engine, 50);

        // Live lock.
        let status = engine
            .check_txn_status(&plain(b"x"), 50, 60, 50, )
            .unwrap();
        assert_eq!(status, TxnStatus::Locked { ttl_ms: 1000 });

        // Committed.
        engine.commit(&[plain(b"x"), plain(b"y")], 50, 55).unwrap();
        let status = engine.check_txn_status(&plain(b"x"), 50, 60, 70).unwrap();
        assert_eq!(status, TxnStatus::Committed { commit_ts: 55 });

        // Unknown transaction gets a rollback tombstone.
        let status = engine.check_txn_status(&plain(b"z"), 80, 90, 100).unwrap();
        assert_eq!(status, TxnStatus::RolledBack);
    }

    #[test]
    fn test_check_txn_status_expired_lock() {
        let (_tmp, engine) = open();
        let start_ts = rangekv_core::codec::compose_ts(1_000_000, 0);
        engine
            .prewrite(PrewriteRequest {
                mutations: vec![Mutation::put(plain(b"e"), b"v".to_vec())],
                primary: plain(b"e"),
                start_ts,
                lock_ttl_ms: 100,
                ..Default::default()
            })
            .unwrap();

        let current_ts = rangekv_core::codec::compose_ts(1_000_500, 0);
        let status = engine
            .check_txn_status(&plain(b"e"), start_ts, 0, current_ts)
            .unwrap();
        assert_eq!(status, TxnStatus::LockExpired);
        assert!(engine.scan_lock(&region_range(), 0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_heartbeat_extends_ttl() {
        let (_tmp, engine) = open();
        prewrite_two(&engine, 10);
        assert_eq!(engine.heartbeat(&plain(b"x"), 10, 5000).unwrap(), 5000);
        assert_eq!(engine.heartbeat(&plain(b"x"), 10, 100).unwrap(), 5000);
        assert!(matches!(
            engine.heartbeat(&plain(b"x"), 99, 100),
            Err(StoreError::TxnNotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_lock_scans_range() {
        let (_tmp, engine) = open();
        prewrite_two(&engine, 10);
        engine.resolve_lock(&region_range(), 10, 11, &[]).unwrap();
        assert_eq!(engine.get(&plain(b"x"), 11).unwrap(), Some(b"1".to_vec()));

        prewrite_two(&engine, 20);
        engine.resolve_lock(&region_range(), 20, 0, &[]).unwrap();
        assert_eq!(engine.get(&plain(b"x"), 30).unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_scan_committed() {
        let (_tmp, engine) = open();
        for (i, key) in [b"a", b"b", b"c"].iter().enumerate() {
            let ts = 10 + i as i64 * 10;
            engine
                .prewrite(PrewriteRequest {
                    mutations: vec![Mutation::put(plain(*key), vec![b'0' + i as u8])],
                    primary: plain(*key),
                    start_ts: ts,
                    lock_ttl_ms: 1000,
                    ..Default::default()
                })
                .unwrap();
            engine.commit(&[plain(*key)], ts, ts + 1).unwrap();
        }
        // Delete "b".
        engine
            .prewrite(PrewriteRequest {
                mutations: vec![Mutation::delete(plain(b"b"))],
                primary: plain(b"b"),
                start_ts: 40,
                lock_ttl_ms: 1000,
                ..Default::default()
            })
            .unwrap();
        engine.commit(&[plain(b"b")], 40, 41).unwrap();

        let ctx = OpContext::none();
        let kvs = engine.scan(&region_range(), 50, 0, false, &ctx).unwrap();
        let keys: Vec<Vec<u8>> = kvs.iter().map(|kv| kv.key.clone()).collect();
        assert_eq!(keys, vec![plain(b"a"), plain(b"c")]);

        // At ts 30 "b" is still visible and "c" is not yet committed.
        let kvs = engine.scan(&region_range(), 30, 0, false, &ctx).unwrap();
        let keys: Vec<Vec<u8>> = kvs.iter().map(|kv| kv.key.clone()).collect();
        assert_eq!(keys, vec![plain(b"a"), plain(b"b")]);

        // Scans fail on a blocking lock.
        prewrite_two(&engine, 60);
        assert!(matches!(
            engine.scan(&region_range(), 70, 0, false, &ctx),
            Err(StoreError::KeyIsLocked { .. })
        ));
    }

    #[test]
    fn test_gc_keeps_visible_version() {
        let (_tmp, engine) = open();
        for ts in [10_i64, 20, 30] {
            engine
                .prewrite(PrewriteRequest {
                    mutations: vec![Mutation::put(plain(b"g"), format!("v{ts}").into_bytes())],
                    primary: plain(b"g"),
                    start_ts: ts,
                    lock_ttl_ms: 1000,
                    ..Default::default()
                })
                .unwrap();
            engine.commit(&[plain(b"g")], ts, ts + 1).unwrap();
        }

        let ctx = OpContext::none();
        let removed = engine.gc(&region_range(), 25, &ctx).unwrap();
        assert!(removed >= 1);
        // Version at commit_ts 21 is the safe-point-visible one; it and the
        // newer version at 31 must survive.
        assert_eq!(engine.get(&plain(b"g"), 25).unwrap(), Some(b"v20".to_vec()));
        assert_eq!(engine.get(&plain(b"g"), 40).unwrap(), Some(b"v30".to_vec()));
        // The version at commit_ts 11 is gone.
        assert_eq!(engine.get(&plain(b"g"), 15).unwrap(), None);
    }

    #[test]
    fn test_dump_lists_families() {
        let (_tmp, engine) = open();
        prewrite_two(&engine, 10);
        engine.commit(&[plain(b"x")], 10, 11).unwrap();

        let dump = engine.dump(&region_range()).unwrap();
        assert_eq!(dump.locks.len(), 1, "y is still locked");
        assert_eq!(dump.writes.len(), 1, "x is committed");
        assert_eq!(dump.datas.len(), 2, "both prewrites wrote data");
    }
}
