//! Disk-backed blob store with an in-memory metadata index

use crate::error::{CacheError, Result};
use crate::types::{CacheEntry, CacheStats, CachedBlob, ClearOutcome};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const TEMP_SUFFIX: &str = ".tmp";
const MAX_KEY_LEN: usize = 128;

/// A content-addressed blob store.
///
/// Each blob lives in `{cache_dir}/{key}`. Metadata is kept in a sharded
/// concurrent map, so operations on different keys never contend on a
/// store-wide lock. No lock is held across an await; the only file
/// operation done under an index slot is the rename that publishes a blob.
pub struct BlobStore {
    /// In-memory metadata for cached entries
    entries: DashMap<String, CacheEntry>,
    /// Directory where cached blobs are stored
    cache_dir: PathBuf,
    /// Sequence for unique temp file names
    write_seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlobStore {
    /// Create a new store rooted at `cache_dir`. Call [`BlobStore::init`] before use.
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            entries: DashMap::new(),
            cache_dir,
            write_seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Ensure the cache directory exists and rebuild the index from disk.
    ///
    /// Leftover temp files from interrupted writes and zero-byte blobs are
    /// removed. Surviving blobs start with their modification time as the
    /// last access time.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.cache_dir).await?;

        let mut restored = 0usize;
        let mut dir = fs::read_dir(&self.cache_dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            let path = item.path();
            let meta = match item.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };

            if is_temp_name(&name) {
                remove_file_quietly(&path).await;
                continue;
            }
            if validate_key(&name).is_err() {
                continue;
            }
            if meta.len() == 0 {
                remove_file_quietly(&path).await;
                continue;
            }

            let touched = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
            self.entries.insert(
                name.clone(),
                CacheEntry {
                    hash: name,
                    size: meta.len(),
                    created_at: touched,
                    last_accessed_at: touched,
                },
            );
            restored += 1;
        }

        info!(cache_dir = ?self.cache_dir, restored, "Cache initialized");
        Ok(())
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(key)
    }

    /// Look up a blob. A hit refreshes the entry's last access time.
    ///
    /// The returned bytes are owned by the caller, so a later delete or
    /// eviction of the same key cannot affect them.
    pub async fn get(&self, key: &str) -> Option<CachedBlob> {
        if validate_key(key).is_err() || !self.entries.contains_key(key) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match fs::read(self.blob_path(key)).await {
            Ok(data) if !data.is_empty() => {
                let touched = self.entries.get_mut(key).map(|mut entry| {
                    entry.last_accessed_at = Utc::now();
                    entry.clone()
                });

                // None here means the entry was deleted while we were reading
                if let Some(entry) = touched {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key, size = data.len(), "Cache hit");
                    return Some(CachedBlob {
                        entry,
                        data: Bytes::from(data),
                    });
                }
            }
            Ok(_) => {
                warn!(key, "Cached blob is empty, removing entry");
                self.entries.remove(key);
                remove_file_quietly(&self.blob_path(key)).await;
            }
            Err(e) => {
                warn!(key, error = %e, "Failed to read cached blob, removing entry");
                self.entries.remove(key);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a blob, replacing any existing blob for the same key.
    ///
    /// The data is written to a temp file in the cache directory and renamed
    /// into place, so concurrent writers are last-writer-wins and readers
    /// only ever see a complete blob. The rename happens while holding the
    /// key's index slot, so the indexed entry always describes the file the
    /// last writer left on disk.
    pub async fn put(&self, key: &str, data: &[u8]) -> Result<CacheEntry> {
        validate_key(key)?;

        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let temp_path = self
            .cache_dir
            .join(format!(".{}.{}.{}{}", key, std::process::id(), seq, TEMP_SUFFIX));

        if let Err(e) = write_synced(&temp_path, data).await {
            remove_file_quietly(&temp_path).await;
            return Err(e.into());
        }

        let now = Utc::now();
        let entry = CacheEntry {
            hash: key.to_string(),
            size: data.len() as u64,
            created_at: now,
            last_accessed_at: now,
        };

        let published = {
            let slot = self.entries.entry(key.to_string());
            std::fs::rename(&temp_path, self.blob_path(key)).map(|()| {
                slot.insert(entry.clone());
            })
        };
        if let Err(e) = published {
            remove_file_quietly(&temp_path).await;
            return Err(e.into());
        }
        debug!(key, size = entry.size, "Cached blob");

        Ok(entry)
    }

    /// Remove a blob. Returns whether an entry was present.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        if validate_key(key).is_err() {
            return Ok(false);
        }

        let removed = self.entries.remove(key);
        match fs::remove_file(self.blob_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(removed.is_some()),
            Err(e) => {
                // The blob is still on disk, so keep it indexed
                if let Some((key, entry)) = removed {
                    self.entries.entry(key).or_insert(entry);
                }
                Err(e.into())
            }
        }
    }

    /// Remove every entry.
    ///
    /// A key that cannot be removed does not stop the others; it is
    /// reported in [`ClearOutcome::failed`] and stays cached.
    pub async fn clear_all(&self) -> ClearOutcome {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();

        let mut outcome = ClearOutcome::default();
        for key in keys {
            match self.delete(&key).await {
                Ok(true) => outcome.removed.push(key),
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to remove cached blob");
                    outcome.failed.push(key);
                }
            }
        }

        info!(
            removed = outcome.removed.len(),
            failed = outcome.failed.len(),
            "Cleared blob cache"
        );
        outcome
    }

    /// Iterate over entry metadata without loading blob bytes.
    ///
    /// The iterator borrows index shards; collect it before awaiting.
    pub fn enumerate(&self) -> impl Iterator<Item = CacheEntry> + '_ {
        self.entries.iter().map(|e| e.value().clone())
    }

    /// Current metadata for a single key
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        let (entries, total_size) = self
            .enumerate()
            .fold((0usize, 0u64), |(count, size), e| (count + 1, size + e.size));

        CacheStats {
            entries,
            total_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Remove zero-byte, missing or unreadable blobs and stale temp files.
    ///
    /// Non-empty blobs found on disk without an index entry are adopted.
    /// Temp files younger than `temp_grace` may belong to an in-progress
    /// write and are left alone.
    pub(crate) async fn remove_orphans(&self, temp_grace: Duration) -> Result<usize> {
        let mut removed = 0;

        let indexed: Vec<CacheEntry> = self.enumerate().collect();
        for entry in indexed {
            let path = self.blob_path(&entry.hash);
            match blob_size(&path).await {
                Ok(Some(size)) => {
                    if size != entry.size {
                        if let Some(mut live) = self.entries.get_mut(&entry.hash) {
                            live.size = size;
                        }
                    }
                }
                Ok(None) => {
                    warn!(key = %entry.hash, "Removing empty or irregular cached blob");
                    self.entries.remove(&entry.hash);
                    remove_file_quietly(&path).await;
                    removed += 1;
                }
                Err(e) => {
                    warn!(key = %entry.hash, error = %e, "Removing unreadable cache entry");
                    self.entries.remove(&entry.hash);
                    remove_file_quietly(&path).await;
                    removed += 1;
                }
            }
        }

        let mut dir = fs::read_dir(&self.cache_dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            let meta = match item.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };

            if is_temp_name(&name) {
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|m| SystemTime::now().duration_since(m).ok())
                    .unwrap_or_default();
                if age >= temp_grace {
                    remove_file_quietly(&item.path()).await;
                    removed += 1;
                }
                continue;
            }
            if validate_key(&name).is_err() || self.entries.contains_key(&name) {
                continue;
            }

            if meta.len() == 0 {
                remove_file_quietly(&item.path()).await;
                removed += 1;
            } else {
                let now = Utc::now();
                self.entries.entry(name.clone()).or_insert(CacheEntry {
                    hash: name,
                    size: meta.len(),
                    created_at: now,
                    last_accessed_at: now,
                });
            }
        }

        Ok(removed)
    }

    #[cfg(test)]
    pub(crate) fn set_last_accessed(&self, key: &str, at: DateTime<Utc>) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.last_accessed_at = at;
        }
    }
}

/// Keys become file names: only non-empty lowercase hex is accepted
fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidKey(key.to_string()))
    }
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

/// Size of a readable, non-empty blob; `None` for an empty or irregular file.
/// Reads the first byte, so permission and media errors surface here.
async fn blob_size(path: &Path) -> std::io::Result<Option<u64>> {
    let meta = fs::metadata(path).await?;
    if !meta.is_file() || meta.len() == 0 {
        return Ok(None);
    }

    let mut file = fs::File::open(path).await?;
    let mut first = [0u8; 1];
    file.read_exact(&mut first).await?;
    Ok(Some(meta.len()))
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = ?path, error = %e, "Failed to remove cache file");
        }
    }
}
