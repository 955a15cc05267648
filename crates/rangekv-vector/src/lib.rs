//! RangeKV vector layer.
//!
//! Approximate-nearest-neighbor indices and the hybrid filter-and-search
//! engine joining them with the KV ground truth:
//! - `distance`: metrics and kernels
//! - `flat` / `hnsw`: the index variants
//! - `index`: the tagged variant, capability trait and id filters
//! - `filter`: scalar predicate evaluation (equality map and compiled
//!   expressions)
//! - `holder`: per-region index lifecycle behind a reader-writer lock
//! - `reader`: the query engine (search pipeline, scans, build, metrics)

pub mod distance;
pub mod filter;
pub mod flat;
pub mod hnsw;
pub mod holder;
pub mod index;
pub mod reader;

pub use distance::Metric;
pub use filter::{CmpOp, ExprFilter, MapFilter, ScalarExpr, ScalarPredicate};
pub use flat::FlatIndex;
pub use hnsw::{HnswIndex, HnswParams};
pub use holder::{index_snapshot_path, IndexState, IndexStatus, VectorIndexHolder};
pub use index::{AnyVectorIndex, IndexFilter, SearchHit, VectorIndexOps, VectorIndexParams};
pub use reader::{
    calc_distance, FilterKind, ScanRequest, SearchRequest, VectorQueryContext,
    VectorReader, VectorRegionMetrics,
};
