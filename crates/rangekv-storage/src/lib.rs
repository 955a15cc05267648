//! RangeKV storage layer.
//!
//! Wraps the log-structured engine behind a column-family-aware API and
//! builds the versioned machinery on top of it:
//! - `column_families`: family definitions, per-family tuning, the
//!   versioned-key comparator
//! - `raw`: engine wrapper (readers, writers, iterators, snapshots,
//!   checkpoint and SST ingest)
//! - `mvcc`: timestamp-versioned read views
//! - `txn`: Percolator two-phase-commit engine
//! - `split`: merged multi-family iteration and split-key policies

pub mod column_families;
pub mod mvcc;
pub mod raw;
pub mod split;
pub mod txn;

pub use column_families::cf_names;
pub use mvcc::{MvccIterator, MvccReader};
pub use raw::{build_sst_file, IterOptions, RawIter, RawSnapshot, RawStore, RawWriteBatch,
    SstFileMeta};
