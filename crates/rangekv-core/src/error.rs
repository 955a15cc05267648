//! Error types shared by every RangeKV component.
//!
//! All fallible operations return [`StoreResult`]. Component-internal errors
//! are translated into one of these kinds before they cross a crate boundary,
//! so the region operation surface only ever surfaces a single error enum.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error kinds surfaced by the region core.
///
/// The set is closed on purpose: the RPC layer above maps each variant to a
/// wire error code, and background tasks pattern-match on variants to decide
/// whether to retry.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An empty (or reserved) key was supplied.
    #[error("key is empty or reserved")]
    KeyEmpty,

    /// The requested key has no visible version.
    #[error("key not found")]
    KeyNotFound,

    /// A range is malformed: start > end, or the range touches the reserved
    /// end of keyspace.
    #[error("invalid range: {0}")]
    RangeInvalid(String),

    /// A key written by this core failed to decode. Codec-level corruption;
    /// the offending bytes never reached the value layer.
    #[error("corrupt key: {0}")]
    CorruptKey(String),

    /// Stored data the core itself wrote failed to decode. Fatal for the
    /// region: the caller marks it read-only pending operator intervention.
    #[error("corruption in {location}: {details}")]
    Corruption { location: String, details: String },

    /// Unexpected engine or internal failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// A conflicting lock is held on the key by another transaction.
    #[error("key is locked: key={key:?} lock_ts={lock_ts}")]
    KeyIsLocked { key: Vec<u8>, lock_ts: i64 },

    /// A newer committed write conflicts with the requested start/for-update
    /// timestamp.
    #[error("write conflict: key={key:?} start_ts={start_ts} conflict_ts={conflict_ts}")]
    WriteConflict {
        key: Vec<u8>,
        start_ts: i64,
        conflict_ts: i64,
    },

    /// The transaction the operation refers to does not exist (it was never
    /// started here, or has already been fully resolved).
    #[error("txn not found: start_ts={start_ts}")]
    TxnNotFound { start_ts: i64 },

    /// The expected lock record is missing.
    #[error("lock not found: key={key:?} start_ts={start_ts}")]
    LockNotFound { key: Vec<u8>, start_ts: i64 },

    /// The operation deadline elapsed before completion.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The operation's cancel token was triggered.
    #[error("cancelled")]
    Cancelled,

    /// The operation is not supported by the selected index or engine.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A vector's dimension disagrees with the index dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The vector index has not been built or loaded yet.
    #[error("vector index not ready")]
    IndexNotReady,

    /// The caller's region epoch is stale.
    #[error("epoch changed: expected {expected}, current {current}")]
    EpochChanged { expected: String, current: String },

    /// This node is not the leader for the region.
    #[error("not leader")]
    NotLeader,

    /// No such region on this store.
    #[error("region not found: {0}")]
    RegionNotFound(i64),

    /// The region or cluster is read-only.
    #[error("read only")]
    ReadOnly,

    /// An index refused an insert because its capacity is exhausted.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// A filter expression does not match the declared scalar schema.
    #[error("schema error: {0}")]
    SchemaError(String),
}

impl StoreError {
    /// True when the error is a transaction conflict the client is expected
    /// to retry with a fresh timestamp.
    pub fn is_txn_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::KeyIsLocked { .. } | StoreError::WriteConflict { .. }
        )
    }

    /// Corruption is fatal for the owning region; everything else is not.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Corruption { .. })
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Corruption {
            location: "record decode".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Internal(format!("io: {err}"))
    }
}

static_assertions::assert_impl_all!(StoreError: Send, Sync, std::error::Error);
