//! Request orchestration: resolve, serve from cache, fetch through on miss

use crate::cdn::CdnGateway;
use crate::config::{Config, SettingsHandle};
use crate::error::{FetchError, Result};
use crate::fetcher::{FetchHooks, OriginFetcher};
use crate::hash::{ContentHash, HashResolver, Identifier, UserDirectory};
use crate::types::{Avatar, AvatarResponse, CacheStatus, ClearReport, PurgeReport, RedirectReason};
use async_trait::async_trait;
use avatar_blob_cache::{BlobStore, CacheError, CacheStats, CleanupReport, EvictionManager};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Concurrent CDN purges issued by a clear-all
const PURGE_CONCURRENCY: usize = 8;

/// Answers "give me the avatar for this identifier".
///
/// Holds no state of its own beyond handles to its collaborators; cloning
/// is cheap and clones share everything.
#[derive(Clone)]
pub struct ProxyService {
    resolver: HashResolver,
    store: Arc<BlobStore>,
    eviction: Arc<EvictionManager>,
    fetcher: Arc<OriginFetcher>,
    cdn: Arc<CdnGateway>,
    settings: SettingsHandle,
    default_avatar_url: String,
}

impl ProxyService {
    pub fn new(
        resolver: HashResolver,
        store: Arc<BlobStore>,
        eviction: Arc<EvictionManager>,
        fetcher: Arc<OriginFetcher>,
        cdn: Arc<CdnGateway>,
        settings: SettingsHandle,
        default_avatar_url: String,
    ) -> Self {
        Self {
            resolver,
            store,
            eviction,
            fetcher,
            cdn,
            settings,
            default_avatar_url,
        }
    }

    /// Build every collaborator from configuration and load the on-disk cache
    pub async fn from_config(config: &Config, directory: Arc<dyn UserDirectory>) -> Result<Self> {
        let store = Arc::new(BlobStore::new(config.cache_dir.clone()));
        store.init().await?;

        let settings = SettingsHandle::new(config.settings.clone());
        let eviction = Arc::new(EvictionManager::new(store.clone()));
        let writer = CacheWriter {
            store: store.clone(),
            eviction: eviction.clone(),
            settings: settings.clone(),
        };
        let fetcher = Arc::new(
            OriginFetcher::new(&config.upstream_url, config.fetch_timeout)
                .with_negative_ttl(config.negative_ttl)
                .with_hooks(Arc::new(writer)),
        );
        let cdn = Arc::new(CdnGateway::new(
            settings.clone(),
            &config.public_url,
            config.purge_timeout,
        ));

        Ok(Self::new(
            HashResolver::new(directory),
            store,
            eviction,
            fetcher,
            cdn,
            settings,
            config.default_avatar_url.clone(),
        ))
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    /// Where clients should load the avatar for `identifier` from.
    /// `None` means the identifier has no usable email; keep the original URL.
    pub async fn avatar_url(&self, identifier: &Identifier) -> Option<String> {
        let hash = self.resolver.resolve(identifier).await?;
        Some(self.cdn.url_for(&hash))
    }

    /// An `<img>` tag showing `identifier`'s avatar at `size` pixels square,
    /// loaded from [`avatar_url`](Self::avatar_url).
    /// `None` means the identifier has no usable email; keep the original markup.
    pub async fn avatar_html(&self, identifier: &Identifier, size: u32, alt: &str) -> Option<String> {
        let src = self.avatar_url(identifier).await?;
        Some(format!(
            r#"<img src="{src}" alt="{alt}" class="avatar avatar-{size} photo" height="{size}" width="{size}">"#,
            src = escape_attr(&src),
            alt = escape_attr(alt),
        ))
    }

    /// Serve the avatar for an identifier
    pub async fn avatar_for(&self, identifier: &Identifier) -> AvatarResponse {
        match self.resolver.resolve(identifier).await {
            Some(hash) => self.avatar(&hash).await,
            None => self.unresolved(),
        }
    }

    /// Serve a hash supplied by a client.
    ///
    /// Malformed hashes get the default avatar. With `redirect_to_cdn` set and
    /// a CDN configured, the client is sent to the CDN copy instead.
    pub async fn serve_hash(&self, raw: &str, redirect_to_cdn: bool) -> AvatarResponse {
        let Some(hash) = ContentHash::parse(raw) else {
            debug!(raw, "Malformed avatar hash");
            return self.unresolved();
        };

        if redirect_to_cdn {
            if let Some(location) = self.cdn.cdn_url(&hash) {
                return AvatarResponse::Redirect {
                    location,
                    reason: RedirectReason::Cdn,
                };
            }
        }

        self.avatar(&hash).await
    }

    /// Serve the avatar bytes for a hash, fetching and caching them on a miss.
    ///
    /// The fetch stores the avatar before any caller is answered; the entry
    /// limit is enforced after the callers have their bytes.
    pub async fn avatar(&self, hash: &ContentHash) -> AvatarResponse {
        if let Some(hit) = self.store.get(hash.as_str()).await {
            return AvatarResponse::Image {
                avatar: Avatar::from_bytes(hit.data),
                cache: CacheStatus::Hit,
            };
        }

        match self.fetcher.fetch(hash).await {
            Ok(avatar) => AvatarResponse::Image {
                avatar,
                cache: CacheStatus::Miss,
            },
            Err(FetchError::NotFound) => AvatarResponse::Redirect {
                location: self.fetcher.origin_url(hash),
                reason: RedirectReason::NoAvatar,
            },
            Err(e) => {
                debug!(hash = %hash, error = %e, "Serving upstream URL after transient failure");
                AvatarResponse::Redirect {
                    location: self.fetcher.origin_url(hash),
                    reason: RedirectReason::Transient,
                }
            }
        }
    }

    fn unresolved(&self) -> AvatarResponse {
        AvatarResponse::Redirect {
            location: self.default_avatar_url.clone(),
            reason: RedirectReason::Unresolved,
        }
    }

    /// Periodic maintenance: orphan scan plus entry limit
    pub async fn cleanup(&self) -> std::result::Result<CleanupReport, CacheError> {
        self.eviction
            .cleanup(self.settings.get().max_cache_entries)
            .await
    }

    /// Remove every cached avatar, then purge each removed one from the CDN edge.
    ///
    /// Avatars that cannot be removed locally stay cached and are not purged.
    /// Both kinds of failure are counted, never returned as errors.
    pub async fn clear_cache(&self) -> ClearReport {
        let outcome = self.store.clear_all().await;
        self.fetcher.forget_all();

        let hashes: Vec<ContentHash> = outcome
            .removed
            .iter()
            .filter_map(|key| ContentHash::parse(key))
            .collect();

        let mut report = ClearReport {
            removed: outcome.removed.len(),
            remove_failed: outcome.failed.len(),
            ..ClearReport::default()
        };

        if self.settings.get().cdn_base().is_some() {
            let outcomes: Vec<bool> = stream::iter(hashes)
                .map(|hash| async move { self.cdn.purge(&hash).await })
                .buffer_unordered(PURGE_CONCURRENCY)
                .collect()
                .await;

            report.purged = outcomes.iter().filter(|ok| **ok).count();
            report.purge_failed = outcomes.len() - report.purged;
        }

        info!(
            removed = report.removed,
            remove_failed = report.remove_failed,
            purged = report.purged,
            purge_failed = report.purge_failed,
            "Cleared avatar cache"
        );
        report
    }

    /// Drop one avatar locally and from the CDN edge
    pub async fn purge(&self, hash: &ContentHash) -> std::result::Result<PurgeReport, CacheError> {
        let removed = self.store.delete(hash.as_str()).await?;
        self.fetcher.forget(hash).await;
        let cdn_purged = self.cdn.purge(hash).await;

        info!(hash = %hash, removed, cdn_purged, "Purged avatar");
        Ok(PurgeReport {
            removed,
            cdn_purged,
        })
    }
}

/// Persists fetched avatars and keeps the store within its entry budget
struct CacheWriter {
    store: Arc<BlobStore>,
    eviction: Arc<EvictionManager>,
    settings: SettingsHandle,
}

#[async_trait]
impl FetchHooks for CacheWriter {
    async fn stored(&self, hash: &ContentHash) -> Option<Avatar> {
        self.store.entry(hash.as_str())?;
        let hit = self.store.get(hash.as_str()).await?;
        Some(Avatar::from_bytes(hit.data))
    }

    async fn fetched(&self, hash: &ContentHash, avatar: &Avatar) {
        // The fetched bytes are served even when they cannot be cached
        if let Err(e) = self.store.put(hash.as_str(), &avatar.data).await {
            warn!(hash = %hash, error = %e, "Failed to cache avatar");
        }
    }

    async fn settled(&self) {
        self.eviction
            .request_limit(self.settings.get().max_cache_entries)
            .await;
    }
}

fn escape_attr(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
