//! Upstream avatar fetching with per-hash de-duplication

use crate::error::FetchError;
use crate::hash::ContentHash;
use crate::types::{sniff_content_type, Avatar};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use moka::future::Cache;
use parking_lot::Mutex;
use reqwest::{header, Client, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub type FetchResult = std::result::Result<Avatar, FetchError>;

type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;
type InFlightMap = Arc<Mutex<HashMap<ContentHash, SharedFetch>>>;

const NEGATIVE_MEMO_CAPACITY: u64 = 100_000;

/// Callbacks run on the fetch task, once per upstream fetch no matter how
/// many callers are waiting on it
#[async_trait]
pub trait FetchHooks: Send + Sync {
    /// A copy stored since the caller missed; checked before going upstream
    async fn stored(&self, _hash: &ContentHash) -> Option<Avatar> {
        None
    }

    /// Persist a freshly fetched avatar. Waiters are released once this returns.
    async fn fetched(&self, _hash: &ContentHash, _avatar: &Avatar) {}

    /// Runs after the waiters on a fresh fetch have been released
    async fn settled(&self) {}
}

struct NoHooks;

#[async_trait]
impl FetchHooks for NoHooks {}

/// Fetches avatars from the upstream provider.
///
/// At most one request per hash is outstanding at any time: callers that
/// arrive while a fetch is running wait for its result instead. Each fetch
/// runs on its own task, so it completes even if every caller goes away.
pub struct OriginFetcher {
    client: Client,
    upstream_url: String,
    in_flight: InFlightMap,
    hooks: Arc<dyn FetchHooks>,
    /// Hashes upstream recently reported as having no avatar
    not_found: Option<Cache<ContentHash, ()>>,
}

impl OriginFetcher {
    /// Create a fetcher for `upstream_url` (e.g. `https://secure.gravatar.com/avatar`)
    pub fn new(upstream_url: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("gravatar-proxy/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            upstream_url: upstream_url.trim_end_matches('/').to_string(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            hooks: Arc::new(NoHooks),
            not_found: None,
        }
    }

    /// Remember upstream "no avatar" answers for `ttl`; zero disables the memo
    pub fn with_negative_ttl(mut self, ttl: Duration) -> Self {
        self.not_found = (!ttl.is_zero()).then(|| {
            Cache::builder()
                .max_capacity(NEGATIVE_MEMO_CAPACITY)
                .time_to_live(ttl)
                .build()
        });
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn FetchHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// The upstream URL for a hash, rendering upstream's default when it has no avatar
    pub fn origin_url(&self, hash: &ContentHash) -> String {
        format!("{}/{}", self.upstream_url, hash)
    }

    /// Fetch the avatar for `hash`, joining a fetch already in flight for it
    pub async fn fetch(&self, hash: &ContentHash) -> FetchResult {
        if let Some(memo) = &self.not_found {
            if memo.contains_key(hash) {
                debug!(hash = %hash, "Upstream recently reported no avatar");
                return Err(FetchError::NotFound);
            }
        }

        let pending = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(hash) {
                Some(pending) => {
                    debug!(hash = %hash, "Joining in-flight fetch");
                    pending.clone()
                }
                None => {
                    let pending = self.spawn_fetch(hash.clone());
                    in_flight.insert(hash.clone(), pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    fn spawn_fetch(&self, hash: ContentHash) -> SharedFetch {
        let client = self.client.clone();
        let url = format!("{}/{}?d=404", self.upstream_url, hash);
        let not_found = self.not_found.clone();
        let hooks = Arc::clone(&self.hooks);
        let guard = InFlightGuard {
            map: Arc::clone(&self.in_flight),
            hash: hash.clone(),
        };
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            if let Some(avatar) = hooks.stored(&hash).await {
                debug!(hash = %hash, "Avatar stored since the miss, skipping upstream");
                drop(guard);
                let _ = tx.send(Ok(avatar));
                return;
            }

            let result = request_avatar(&client, &url).await;
            match &result {
                Ok(avatar) => hooks.fetched(&hash, avatar).await,
                Err(FetchError::NotFound) => {
                    if let Some(memo) = &not_found {
                        memo.insert(hash, ()).await;
                    }
                }
                Err(e) => warn!(hash = %hash, error = %e, "Upstream fetch failed"),
            }
            let fresh = result.is_ok();

            drop(guard);
            // Nobody may be listening any more; the avatar is stored regardless
            let _ = tx.send(result);
            if fresh {
                hooks.settled().await;
            }
        });

        async move {
            rx.await.unwrap_or_else(|_| {
                Err(FetchError::Upstream("fetch task ended without a result".to_string()))
            })
        }
        .boxed()
        .shared()
    }

    /// Drop any remembered "no avatar" answer for `hash`
    pub async fn forget(&self, hash: &ContentHash) {
        if let Some(memo) = &self.not_found {
            memo.invalidate(hash).await;
        }
    }

    pub fn forget_all(&self) {
        if let Some(memo) = &self.not_found {
            memo.invalidate_all();
        }
    }

    /// Number of fetches currently outstanding
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// Removes the in-flight slot when the fetch task ends, including by panic
struct InFlightGuard {
    map: InFlightMap,
    hash: ContentHash,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map.lock().remove(&self.hash);
    }
}

async fn request_avatar(client: &Client, url: &str) -> FetchResult {
    debug!(url, "Fetching avatar from upstream");

    let response = client.get(url).send().await?;
    let status = response.status();

    if status == StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound);
    }
    if !status.is_success() {
        return Err(FetchError::Upstream(format!("upstream returned status {}", status)));
    }

    let declared = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|ct| ct.starts_with("image/"))
        .map(str::to_string);

    let data = response.bytes().await?;
    if data.is_empty() {
        return Err(FetchError::Upstream("upstream returned an empty body".to_string()));
    }

    let content_type = declared.unwrap_or_else(|| sniff_content_type(&data).to_string());
    debug!(size = data.len(), content_type = %content_type, "Fetched avatar");

    Ok(Avatar { data, content_type })
}
