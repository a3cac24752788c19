//! Delivery URLs and CDN edge invalidation

use crate::config::SettingsHandle;
use crate::hash::ContentHash;
use reqwest::{Client, Method};
use std::time::Duration;
use tracing::{debug, warn};

/// Computes where clients should load an avatar from, and purges the CDN
/// edge when local content changes.
///
/// The CDN base URL is read from the live settings on every call.
pub struct CdnGateway {
    client: Client,
    purge_method: Method,
    settings: SettingsHandle,
    /// Base URL of this service, e.g. `https://blog.example.com`
    public_url: String,
}

impl CdnGateway {
    pub fn new(settings: SettingsHandle, public_url: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");
        let purge_method = Method::from_bytes(b"PURGE").expect("PURGE is a valid method token");

        Self {
            client,
            purge_method,
            settings,
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    /// `{cdn}/{hash}.jpg` when a CDN is configured, otherwise the local proxy URL
    pub fn url_for(&self, hash: &ContentHash) -> String {
        match self.settings.get().cdn_base() {
            Some(base) => cdn_url(base, hash),
            None => self.local_url(hash),
        }
    }

    /// The local proxy endpoint for a hash
    pub fn local_url(&self, hash: &ContentHash) -> String {
        format!("{}/gravatar-proxy/?hash={}", self.public_url, hash)
    }

    /// The CDN URL for a hash, if a CDN is configured
    pub fn cdn_url(&self, hash: &ContentHash) -> Option<String> {
        self.settings.get().cdn_base().map(|base| cdn_url(base, hash))
    }

    /// Ask the CDN edge to drop its copy of `hash`.
    ///
    /// Returns `false` without any network call when no CDN is configured,
    /// and `false` when the edge cannot be reached or does not answer with
    /// a success status. Never fails otherwise.
    pub async fn purge(&self, hash: &ContentHash) -> bool {
        let Some(url) = self.cdn_url(hash) else {
            return false;
        };

        match self.client.request(self.purge_method.clone(), &url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(hash = %hash, url = %url, "Purged CDN edge");
                true
            }
            Ok(response) => {
                warn!(hash = %hash, status = %response.status(), "CDN purge rejected");
                false
            }
            Err(e) => {
                warn!(hash = %hash, error = %e, "CDN purge failed");
                false
            }
        }
    }
}

fn cdn_url(base: &str, hash: &ContentHash) -> String {
    format!("{}/{}.jpg", base, hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::test_support::spawn_cdn;
    use axum::http::StatusCode;

    fn gateway(cdn_base_url: &str) -> CdnGateway {
        let settings = SettingsHandle::new(Settings {
            cdn_base_url: cdn_base_url.to_string(),
            ..Settings::default()
        });
        CdnGateway::new(settings, "https://blog.example.com/", Duration::from_secs(2))
    }

    fn user_hash() -> ContentHash {
        ContentHash::from_email("User@Example.com ").unwrap()
    }

    #[test]
    fn test_url_for_with_cdn() {
        let gateway = gateway("https://cdn.example.com/");
        assert_eq!(
            gateway.url_for(&user_hash()),
            "https://cdn.example.com/b58996c504c5638798eb6b511e6f49af.jpg"
        );
    }

    #[test]
    fn test_url_for_without_cdn() {
        let gateway = gateway("");
        assert_eq!(
            gateway.url_for(&user_hash()),
            "https://blog.example.com/gravatar-proxy/?hash=b58996c504c5638798eb6b511e6f49af"
        );
        assert!(gateway.cdn_url(&user_hash()).is_none());
    }

    #[test]
    fn test_url_for_follows_settings_changes() {
        let settings = SettingsHandle::new(Settings::default());
        let gateway =
            CdnGateway::new(settings.clone(), "https://blog.example.com", Duration::from_secs(2));

        assert!(gateway.url_for(&user_hash()).contains("/gravatar-proxy/"));
        settings.update(Settings {
            cdn_base_url: "https://cdn.example.com".into(),
            ..Settings::default()
        });
        assert!(gateway.url_for(&user_hash()).starts_with("https://cdn.example.com/"));
    }

    #[test]
    fn test_purge_method_is_purge() {
        assert_eq!(gateway("https://cdn.example.com").purge_method.as_str(), "PURGE");
    }

    #[tokio::test]
    async fn test_purge_without_cdn_is_noop() {
        assert!(!gateway("").purge(&user_hash()).await);
    }

    #[tokio::test]
    async fn test_purge_sends_purge_request() {
        let cdn = spawn_cdn(StatusCode::OK).await;
        let gateway = gateway(&cdn.base_url);

        assert!(gateway.purge(&user_hash()).await);
        assert_eq!(
            cdn.requests(),
            vec![(
                axum::http::Method::from_bytes(b"PURGE").unwrap(),
                "/b58996c504c5638798eb6b511e6f49af.jpg".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_purge_rejected() {
        let cdn = spawn_cdn(StatusCode::FORBIDDEN).await;
        assert!(!gateway(&cdn.base_url).purge(&user_hash()).await);
        assert_eq!(cdn.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_purge_unreachable() {
        assert!(!gateway("http://127.0.0.1:1").purge(&user_hash()).await);
    }
}
