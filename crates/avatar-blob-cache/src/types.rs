//! Cache types

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata for a cached blob entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub hash: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// A cache hit: the entry's metadata plus its bytes, owned by the reader
#[derive(Debug, Clone)]
pub struct CachedBlob {
    pub entry: CacheEntry,
    pub data: Bytes,
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Outcome of [`BlobStore::clear_all`](crate::BlobStore::clear_all)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearOutcome {
    /// Keys whose blobs were removed
    pub removed: Vec<String>,
    /// Keys whose blobs could not be removed and are still cached
    pub failed: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_size, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_cache_entry_serialization() {
        let now = Utc::now();
        let entry = CacheEntry {
            hash: "b58996c504c5638798eb6b511e6f49af".to_string(),
            size: 12345,
            created_at: now,
            last_accessed_at: now,
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("b58996c504c5638798eb6b511e6f49af"));
        assert!(json.contains("12345"));

        let deserialized: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, entry);
    }
}
