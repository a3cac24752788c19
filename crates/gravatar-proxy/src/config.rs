//! Process configuration and runtime-mutable settings

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 1000;
pub const DEFAULT_UPSTREAM_URL: &str = "https://secure.gravatar.com/avatar";
pub const DEFAULT_AVATAR_URL: &str = "https://secure.gravatar.com/avatar/?d=mp";

/// Settings the administrative surface may change while the process runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// CDN base URL; empty disables CDN delivery
    #[serde(default)]
    pub cdn_base_url: String,
    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: usize,
}

fn default_max_cache_entries() -> usize {
    DEFAULT_MAX_CACHE_ENTRIES
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cdn_base_url: String::new(),
            max_cache_entries: DEFAULT_MAX_CACHE_ENTRIES,
        }
    }
}

impl Settings {
    /// Trimmed CDN base without trailing slashes, or `None` when CDN is disabled
    pub fn cdn_base(&self) -> Option<&str> {
        let base = self.cdn_base_url.trim().trim_end_matches('/');
        (!base.is_empty()).then_some(base)
    }

    /// Replace invalid values with defaults
    pub fn normalized(mut self) -> Self {
        self.cdn_base_url = self.cdn_base_url.trim().to_string();
        if self.max_cache_entries == 0 {
            self.max_cache_entries = DEFAULT_MAX_CACHE_ENTRIES;
        }
        self
    }
}

/// Shared handle to the live [`Settings`], read at request time
#[derive(Debug, Clone, Default)]
pub struct SettingsHandle(Arc<RwLock<Settings>>);

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self(Arc::new(RwLock::new(settings.normalized())))
    }

    /// Snapshot of the current settings
    pub fn get(&self) -> Settings {
        self.0.read().clone()
    }

    pub fn update(&self, settings: Settings) -> Settings {
        let settings = settings.normalized();
        *self.0.write() = settings.clone();
        settings
    }
}

/// Configuration for the proxy process
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub cache_dir: PathBuf,
    /// Base URL this service is reachable at, for local proxy URLs
    pub public_url: String,
    pub upstream_url: String,
    pub default_avatar_url: String,
    pub fetch_timeout: Duration,
    pub purge_timeout: Duration,
    /// How long an upstream "no avatar" answer is remembered; zero disables
    pub negative_ttl: Duration,
    pub cleanup_interval: Duration,
    pub settings: Settings,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    /// Parse configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let secs = |key: &str, default: u64| Duration::from_secs(parsed(key).unwrap_or(default));

        let port = lookup("PORT")
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(3005);

        let cache_dir = lookup("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./cache/avatars"));

        let public_url = lookup("PUBLIC_URL")
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| format!("http://localhost:{}", port));

        let upstream_url = lookup("GRAVATAR_URL")
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string());

        let default_avatar_url =
            lookup("DEFAULT_AVATAR_URL").unwrap_or_else(|| DEFAULT_AVATAR_URL.to_string());

        let max_cache_entries = parsed("MAX_CACHE_ENTRIES")
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_CACHE_ENTRIES);

        let settings = Settings {
            cdn_base_url: lookup("CDN_BASE_URL").unwrap_or_default(),
            max_cache_entries,
        }
        .normalized();

        Self {
            port,
            cache_dir,
            public_url,
            upstream_url,
            default_avatar_url,
            fetch_timeout: secs("FETCH_TIMEOUT_SECS", 10),
            purge_timeout: secs("PURGE_TIMEOUT_SECS", 5),
            negative_ttl: secs("NEGATIVE_TTL_SECS", 600),
            cleanup_interval: secs("CLEANUP_INTERVAL_SECS", 24 * 60 * 60),
            settings,
        }
    }
}
