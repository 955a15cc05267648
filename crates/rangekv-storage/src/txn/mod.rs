//! Percolator-style transactions over the raw store.

mod engine;
mod record;

pub use engine::{
    PrewriteRequest, PrewriteResult, SecondaryLocksStatus, TxnDump, TxnEngine,
};
pub use record::{LockKind, LockRecord, Mutation, MutationOp, TxnStatus, WriteKind, WriteRecord};
