//! The coordinator interface the region core consumes.
//!
//! Replication, region bookkeeping and the TSO live outside this crate; the
//! core only ever issues these calls. The coordinator deduplicates repeated
//! split requests for the same region.

use crate::error::StoreResult;
use crate::types::RegionId;

pub trait Coordinator: Send + Sync {
    /// Ask the coordinator to split `region_id` at `split_key` (a plain key
    /// inside the region's range).
    fn split_region(&self, region_id: RegionId, split_key: &[u8]) -> StoreResult<()>;

    /// True when the cluster is in a capacity-protection read-only state;
    /// split checks are suspended while it holds.
    fn cluster_read_only(&self) -> bool {
        false
    }
}

/// A coordinator that accepts everything and records nothing. Placeholder
/// for tests and single-node runs.
#[derive(Debug, Default)]
pub struct NoopCoordinator;

impl Coordinator for NoopCoordinator {
    fn split_region(&self, _region_id: RegionId, _split_key: &[u8]) -> StoreResult<()> {
        Ok(())
    }
}
