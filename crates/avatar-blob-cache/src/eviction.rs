//! LRU eviction and periodic cleanup

use crate::error::Result;
use crate::store::BlobStore;
use crate::types::CacheEntry;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Temp files older than this are treated as abandoned writes
const DEFAULT_TEMP_GRACE: Duration = Duration::from_secs(60 * 60);

/// Outcome of a periodic cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub orphans_removed: usize,
    pub evicted: usize,
}

/// Keeps a [`BlobStore`] within an entry budget.
///
/// Eviction removes the least recently accessed entries first, breaking
/// timestamp ties by ascending hash. Only one eviction pass runs at a time;
/// a request that arrives while a pass is running is handed to that pass
/// instead of waiting for it. Readers and writers of the store never wait
/// on eviction.
pub struct EvictionManager {
    store: Arc<BlobStore>,
    pass: Mutex<()>,
    /// Set when a limit request has not yet been served by a pass
    pending: AtomicBool,
    /// Entry budget of the most recent request
    limit: AtomicUsize,
    temp_grace: Duration,
}

impl EvictionManager {
    pub fn new(store: Arc<BlobStore>) -> Self {
        Self {
            store,
            pass: Mutex::new(()),
            pending: AtomicBool::new(false),
            limit: AtomicUsize::new(usize::MAX),
            temp_grace: DEFAULT_TEMP_GRACE,
        }
    }

    /// Override how old a temp file must be before cleanup removes it
    pub fn with_temp_grace(mut self, temp_grace: Duration) -> Self {
        self.temp_grace = temp_grace;
        self
    }

    /// Evict least recently used entries until at most `max_entries` remain,
    /// waiting for a running pass to finish first.
    /// Returns the number of entries this call evicted.
    pub async fn enforce_limit(&self, max_entries: usize) -> usize {
        self.submit(max_entries);
        let pass = self.pass.lock().await;
        self.drain(pass).await
    }

    /// Like [`enforce_limit`](Self::enforce_limit), but never waits. When a
    /// pass is already running it serves this request before it finishes,
    /// and this call returns 0 immediately.
    pub async fn request_limit(&self, max_entries: usize) -> usize {
        self.submit(max_entries);
        match self.pass.try_lock() {
            Ok(pass) => self.drain(pass).await,
            Err(_) => 0,
        }
    }

    fn submit(&self, max_entries: usize) {
        self.limit.store(max_entries, Ordering::Relaxed);
        self.pending.store(true, Ordering::Release);
    }

    /// Serve pending requests until none are left, then release the pass
    async fn drain(&self, mut pass: MutexGuard<'_, ()>) -> usize {
        let mut evicted = 0;
        loop {
            while self.pending.swap(false, Ordering::AcqRel) {
                evicted += self.evict_excess(self.limit.load(Ordering::Relaxed)).await;
            }
            drop(pass);

            // A request may have been handed off after the last check but
            // before the unlock; nobody else will serve it
            if !self.pending.load(Ordering::Acquire) {
                break;
            }
            match self.pass.try_lock() {
                Ok(next) => pass = next,
                Err(_) => break,
            }
        }
        evicted
    }

    async fn evict_excess(&self, max_entries: usize) -> usize {
        let mut evicted = 0;
        loop {
            let victims = self.victims(max_entries);
            if victims.is_empty() {
                break;
            }
            let evicted_this_round = self.evict(&victims).await;
            if evicted_this_round == 0 {
                break;
            }
            evicted += evicted_this_round;
        }

        if evicted > 0 {
            info!(evicted, max_entries, "Enforced cache entry limit");
        }
        evicted
    }

    /// Snapshot the entries that would have to go to fit `max_entries`,
    /// least recently used first
    fn victims(&self, max_entries: usize) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.store.enumerate().collect();
        if entries.len() <= max_entries {
            return Vec::new();
        }

        entries.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then_with(|| a.hash.cmp(&b.hash))
        });
        entries.truncate(entries.len() - max_entries);
        entries
    }

    /// Delete snapshotted victims, skipping any read or rewritten since
    async fn evict(&self, victims: &[CacheEntry]) -> usize {
        let mut evicted = 0;
        for victim in victims {
            match self.store.entry(&victim.hash) {
                Some(live) if live.last_accessed_at == victim.last_accessed_at => {}
                _ => {
                    debug!(hash = %victim.hash, "Entry used since eviction snapshot, keeping");
                    continue;
                }
            }

            match self.store.delete(&victim.hash).await {
                Ok(true) => {
                    debug!(hash = %victim.hash, "Evicted least recently used entry");
                    evicted += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(hash = %victim.hash, error = %e, "Failed to evict entry"),
            }
        }
        evicted
    }

    /// Periodic maintenance: drop corrupt or orphaned blobs, then enforce the limit.
    ///
    /// The orphan scan runs outside the eviction pass, so requests served
    /// meanwhile are never held up by it.
    pub async fn cleanup(&self, max_entries: usize) -> Result<CleanupReport> {
        let orphans_removed = self.store.remove_orphans(self.temp_grace).await?;
        let evicted = self.enforce_limit(max_entries).await;

        info!(orphans_removed, evicted, "Cache cleanup finished");
        Ok(CleanupReport {
            orphans_removed,
            evicted,
        })
    }
}
