//! Persistence layer for queue state
//!
//! This module provides:
//! - [`KeyValueStore`] trait for the durable key-value seam
//! - [`InMemoryStore`] for testing and single-host embedding
//! - [`PostgresStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryStore;
pub use postgres::{PostgresStore, DEFAULT_TABLE};
pub use store::{KeyValueStore, StoreError};
