//! Region object: identity, range, epoch and lifecycle state.
//!
//! A region exclusively owns a contiguous plain-key range. The registry
//! holds the strong handle; subsystems receive the `Arc` and the region is
//! destroyed only after every in-flight operation has dropped its clone.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use rangekv_core::codec::{encode_plain_key, RAW_PREFIX, TXN_PREFIX};
use rangekv_core::error::{StoreError, StoreResult};
use rangekv_core::types::{Range, RegionEpoch, RegionId, RegionState, RegionType};

#[derive(Debug)]
pub struct Region {
    id: RegionId,
    region_type: RegionType,
    partition_id: i64,
    /// Namespace prefix of every key the region owns (raw vs txn).
    prefix: u8,
    epoch: RwLock<RegionEpoch>,
    range: RwLock<Range>,
    state: RwLock<RegionState>,
    disable_split: AtomicBool,
    temporary_disable_split: AtomicBool,
    /// Metrics refreshed by the split checker's walks.
    approx_size: AtomicU64,
    key_count: AtomicU64,
}

impl Region {
    /// Create a region spanning `[user_start, user_end)` of one partition.
    /// An empty `user_end` extends to the end of the partition.
    pub fn new(
        id: RegionId,
        region_type: RegionType,
        partition_id: i64,
        txn_enabled: bool,
        user_start: &[u8],
        user_end: &[u8],
    ) -> Self {
        let prefix = if txn_enabled { TXN_PREFIX } else { RAW_PREFIX };
        let start_key = encode_plain_key(prefix, partition_id, user_start);
        let end_key = if user_end.is_empty() {
            encode_plain_key(prefix, partition_id + 1, b"")
        } else {
            encode_plain_key(prefix, partition_id, user_end)
        };
        Self {
            id,
            region_type,
            partition_id,
            prefix,
            epoch: RwLock::new(RegionEpoch {
                conf_version: 1,
                version: 1,
            }),
            range: RwLock::new(Range::new(start_key, end_key)),
            state: RwLock::new(RegionState::Normal),
            disable_split: AtomicBool::new(false),
            temporary_disable_split: AtomicBool::new(false),
            approx_size: AtomicU64::new(0),
            key_count: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn region_type(&self) -> RegionType {
        self.region_type
    }

    pub fn partition_id(&self) -> i64 {
        self.partition_id
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn epoch(&self) -> RegionEpoch {
        *self.epoch.read()
    }

    /// Reject requests carrying a stale epoch.
    pub fn check_epoch(&self, expected: Option<RegionEpoch>) -> StoreResult<()> {
        if let Some(expected) = expected {
            let current = self.epoch();
            if expected != current {
                return Err(StoreError::EpochChanged {
                    expected: expected.to_string(),
                    current: current.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Advance the epoch version (split executed) and move the range.
    pub fn apply_split(&self, new_range: Range) {
        let mut epoch = self.epoch.write();
        epoch.version += 1;
        *self.range.write() = new_range;
    }

    pub fn range(&self) -> Range {
        self.range.read().clone()
    }

    /// Encode a user key into this region's plain keyspace.
    pub fn plain_key(&self, user_key: &[u8]) -> Vec<u8> {
        encode_plain_key(self.prefix, self.partition_id, user_key)
    }

    pub fn check_key_in_range(&self, plain_key: &[u8]) -> StoreResult<()> {
        if !self.range.read().contains(plain_key) {
            return Err(StoreError::RangeInvalid(format!(
                "key out of region {} range",
                self.id
            )));
        }
        Ok(())
    }

    pub fn state(&self) -> RegionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: RegionState) {
        *self.state.write() = state;
    }

    /// Serving requires a normal, non-read-only region.
    pub fn check_serving(&self) -> StoreResult<()> {
        match self.state() {
            RegionState::Normal | RegionState::Splitting => Ok(()),
            RegionState::ReadOnly => Err(StoreError::ReadOnly),
            RegionState::Deleting => Err(StoreError::RegionNotFound(self.id)),
        }
    }

    /// Writes additionally require the region not be read-only or deleting.
    pub fn check_writable(&self) -> StoreResult<()> {
        match self.state() {
            RegionState::Normal => Ok(()),
            RegionState::Splitting => Ok(()),
            RegionState::ReadOnly => Err(StoreError::ReadOnly),
            RegionState::Deleting => Err(StoreError::RegionNotFound(self.id)),
        }
    }

    /// Corruption handling: the region stops serving until an operator
    /// intervenes.
    pub fn mark_read_only(&self) {
        *self.state.write() = RegionState::ReadOnly;
    }

    pub fn set_disable_split(&self, disabled: bool) {
        self.disable_split.store(disabled, Ordering::Release);
    }

    pub fn set_temporary_disable_split(&self, disabled: bool) {
        self.temporary_disable_split.store(disabled, Ordering::Release);
    }

    pub fn split_disabled(&self) -> bool {
        self.disable_split.load(Ordering::Acquire)
            || self.temporary_disable_split.load(Ordering::Acquire)
    }

    pub fn update_metrics(&self, approx_size: u64, key_count: u64) {
        if approx_size > 0 {
            self.approx_size.store(approx_size, Ordering::Release);
        }
        if key_count > 0 {
            self.key_count.store(key_count, Ordering::Release);
        }
    }

    pub fn approx_size(&self) -> u64 {
        self.approx_size.load(Ordering::Acquire)
    }

    pub fn key_count(&self) -> u64 {
        self.key_count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Region {
        Region::new(1, RegionType::Kv, 7, false, b"", b"")
    }

    #[test]
    fn test_range_spans_partition() {
        let region = region();
        assert!(region.check_key_in_range(&region.plain_key(b"any-key")).is_ok());
        // A key of the next partition is out of range.
        let foreign = encode_plain_key(region.prefix(), 8, b"k");
        assert!(region.check_key_in_range(&foreign).is_err());
    }

    #[test]
    fn test_epoch_check() {
        let region = region();
        assert!(region.check_epoch(None).is_ok());
        assert!(region.check_epoch(Some(region.epoch())).is_ok());

        let stale = RegionEpoch {
            conf_version: 1,
            version: 0,
        };
        assert!(matches!(
            region.check_epoch(Some(stale)),
            Err(StoreError::EpochChanged { .. })
        ));
    }

    #[test]
    fn test_split_bumps_version_and_moves_range() {
        let region = region();
        let before = region.epoch();
        let narrowed = Range::new(region.plain_key(b""), region.plain_key(b"m"));
        region.apply_split(narrowed.clone());
        assert_eq!(region.epoch().version, before.version + 1);
        assert_eq!(region.range(), narrowed);
        assert!(region.check_key_in_range(&region.plain_key(b"z")).is_err());
    }

    #[test]
    fn test_state_gates() {
        let region = region();
        assert!(region.check_serving().is_ok());
        region.mark_read_only();
        assert!(matches!(region.check_serving(), Err(StoreError::ReadOnly)));
        region.set_state(RegionState::Deleting);
        assert!(matches!(
            region.check_serving(),
            Err(StoreError::RegionNotFound(1))
        ));
    }

    #[test]
    fn test_split_disable_flags() {
        let region = region();
        assert!(!region.split_disabled());
        region.set_temporary_disable_split(true);
        assert!(region.split_disabled());
        region.set_temporary_disable_split(false);
        region.set_disable_split(true);
        assert!(region.split_disabled());
    }

    #[test]
    fn test_txn_region_prefix() {
        let txn_region = Region::new(2, RegionType::Kv, 1, true, b"a", b"z");
        assert_eq!(txn_region.prefix(), TXN_PREFIX);
        assert!(txn_region.check_key_in_range(&txn_region.plain_key(b"m")).is_ok());
        assert!(txn_region
            .check_key_in_range(&txn_region.plain_key(b"zz"))
            .is_err());
    }
}
