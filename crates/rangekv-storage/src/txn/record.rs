//! Lock and write records stored in the transaction column families.
//!
//! Keyspace layout:
//! - `lock` CF: plain key + !LOCK_VER -> [`LockRecord`] (one live lock per key)
//! - `write` CF: plain key + !commit_ts -> [`WriteRecord`]
//! - `data` CF: plain key + !start_ts -> packed user value
//!
//! A committed value is found by locating the newest write record with
//! `commit_ts <= read_ts` and following its `start_ts` into the data family.

use serde::{Deserialize, Serialize};

use rangekv_core::codec::{append_ts, ts_physical_ms};
use rangekv_core::error::StoreResult;

/// Version slot under which a key's (single) lock record is stored. Using
/// the maximum timestamp keeps lock keys in the same encoded shape as every
/// other family, so merged walks and decoders treat them uniformly.
pub const LOCK_VER: i64 = i64::MAX;

/// Lock-family key for a plain key.
pub fn lock_key(plain_key: &[u8]) -> Vec<u8> {
    append_ts(plain_key, LOCK_VER)
}

/// What a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    /// Row lock taken before prewrite; does not block readers.
    Pessimistic,
    /// Optimistic lock without a buffered value.
    Optimistic,
    Put,
    Delete,
}

/// A live lock on one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub primary: Vec<u8>,
    pub start_ts: i64,
    pub ttl_ms: i64,
    pub for_update_ts: i64,
    pub kind: LockKind,
    /// Secondary keys, recorded on the primary for async commit resolution.
    #[serde(default)]
    pub secondaries: Vec<Vec<u8>>,
}

impl LockRecord {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("lock record serialization is infallible")
    }

    pub fn decode(raw: &[u8]) -> StoreResult<Self> {
        Ok(bincode::deserialize(raw)?)
    }

    /// TTL expiry is judged on the physical component of the timestamps.
    pub fn is_expired(&self, current_ts: i64) -> bool {
        ts_physical_ms(current_ts) > ts_physical_ms(self.start_ts) + self.ttl_ms
    }

    /// Pessimistic locks are not prewritten and never block readers.
    pub fn blocks_read(&self, read_ts: i64) -> bool {
        self.kind != LockKind::Pessimistic && self.start_ts <= read_ts
    }
}

/// Commit record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    Put,
    Delete,
    /// Tombstone for a rolled-back start_ts; prevents late prewrites.
    Rollback,
    /// Commit of a lock-only key (no data change).
    Lock,
}

/// A commit record in the write family, keyed by commit_ts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub start_ts: i64,
    pub kind: WriteKind,
}

impl WriteRecord {
    pub fn new(start_ts: i64, kind: WriteKind) -> Self {
        Self { start_ts, kind }
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("write record serialization is infallible")
    }

    pub fn decode(raw: &[u8]) -> StoreResult<Self> {
        Ok(bincode::deserialize(raw)?)
    }

    /// True when this record carries a reference into the data family.
    pub fn references_data(&self) -> bool {
        matches!(self.kind, WriteKind::Put | WriteKind::Delete)
    }
}

/// One prewrite mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub op: MutationOp,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    Put,
    Delete,
    /// Lock the key without changing its value.
    Lock,
}

impl Mutation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op: MutationOp::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            op: MutationOp::Delete,
            key: key.into(),
            value: Vec::new(),
        }
    }

    pub fn lock_kind(&self) -> LockKind {
        match self.op {
            MutationOp::Put => LockKind::Put,
            MutationOp::Delete => LockKind::Delete,
            MutationOp::Lock => LockKind::Optimistic,
        }
    }

    pub fn write_kind(&self) -> WriteKind {
        match self.op {
            MutationOp::Put => WriteKind::Put,
            MutationOp::Delete => WriteKind::Delete,
            MutationOp::Lock => WriteKind::Lock,
        }
    }
}

/// Primary-lock status reported by check-txn-status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnStatus {
    Committed { commit_ts: i64 },
    RolledBack,
    /// The lock is live; carries its TTL in force.
    Locked { ttl_ms: i64 },
    /// The lock had expired and was rolled back by this check.
    LockExpired,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangekv_core::codec::compose_ts;

    #[test]
    fn test_lock_record_round_trip() {
        let lock = LockRecord {
            primary: b"pk".to_vec(),
            start_ts: 10,
            ttl_ms: 1000,
            for_update_ts: 12,
            kind: LockKind::Put,
            secondaries: vec![b"s1".to_vec()],
        };
        let decoded = LockRecord::decode(&lock.encode()).unwrap();
        assert_eq!(decoded, lock);
    }

    #[test]
    fn test_write_record_round_trip() {
        let write = WriteRecord::new(10, WriteKind::Delete);
        assert_eq!(WriteRecord::decode(&write.encode()).unwrap(), write);
        assert!(write.references_data());
        assert!(!WriteRecord::new(10, WriteKind::Rollback).references_data());
    }

    #[test]
    fn test_lock_expiry_uses_physical_ms() {
        let start = compose_ts(1_000_000, 0);
        let lock = LockRecord {
            primary: b"pk".to_vec(),
            start_ts: start,
            ttl_ms: 500,
            for_update_ts: 0,
            kind: LockKind::Put,
            secondaries: Vec::new(),
        };
        assert!(!lock.is_expired(compose_ts(1_000_400, 0)));
        assert!(lock.is_expired(compose_ts(1_000_501, 0)));
    }

    #[test]
    fn test_pessimistic_lock_does_not_block_reads() {
        let mut lock = LockRecord {
            primary: b"pk".to_vec(),
            start_ts: 10,
            ttl_ms: 1000,
            for_update_ts: 10,
            kind: LockKind::Pessimistic,
            secondaries: Vec::new(),
        };
        assert!(!lock.blocks_read(100));
        lock.kind = LockKind::Put;
        assert!(lock.blocks_read(100));
        assert!(!lock.blocks_read(9));
    }
}
