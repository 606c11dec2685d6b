//! Batch store
//!
//! Batches are discovered by a prefix scan, never from a cached list, so
//! enqueueing is safe while a run is consuming the queue.

mod batches;

pub use batches::{generate_batch_key, BatchSet};
