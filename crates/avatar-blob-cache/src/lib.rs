//! Content-addressed disk blob cache with LRU eviction
//!
//! Stores binary blobs on disk keyed by a lowercase hex content hash, with an
//! in-memory metadata index. Writes go through a temp file and an atomic
//! rename, so readers never see a partially written blob.

mod error;
mod eviction;
mod store;
mod types;

pub use error::{CacheError, Result};
pub use eviction::{CleanupReport, EvictionManager};
pub use store::BlobStore;
pub use types::{CacheEntry, CacheStats, CachedBlob, ClearOutcome};
