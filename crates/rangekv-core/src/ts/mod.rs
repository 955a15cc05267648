//! Lock-free monotonic timestamp cache fed by an external TSO.

mod batch;
mod provider;

pub use batch::{BatchTs, BatchTsList};
pub use provider::{LocalTsSource, TsProvider, TsSource, TsoBatch};
