//! RangeKV core: the types, codec, configuration and timestamp machinery
//! shared by every crate of the region store.
//!
//! # Modules
//! - `error`: the single error enum crossing crate boundaries
//! - `types`: regions, ranges, scalar values, vector records
//! - `codec`: bit-exact MVCC key/value encoding
//! - `config`: TOML/env configuration with validation
//! - `ts`: lock-free batched timestamp provider
//! - `coordinator`: the interface the core consumes from the cluster
//!   coordinator

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ts;
pub mod types;

pub use error::{StoreError, StoreResult};
