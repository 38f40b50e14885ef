//! Snapshot aggregation.
//!
//! Every resolved update, literal or produced, is folded into one running
//! snapshot inside a single critical section, so partial updates are applied
//! atomically and in arrival order.

mod aggregator;
mod operations;

pub use aggregator::{Applied, SnapshotSink, StateAggregator};
pub use operations::{merge, validate_keys};
