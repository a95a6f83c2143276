//! Shared cache state and the tagged query cache built on it.

pub mod query_cache;
pub mod store;

pub use query_cache::{CacheKind, CacheStats, InvalidationCallback, QueryCache};
pub use store::{CacheStore, MemoryStore};
