//! Core types for the Gravatar proxy

use avatar_blob_cache::{CacheStats, CleanupReport};
use bytes::Bytes;
use serde::Serialize;

/// An avatar image and its media type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avatar {
    pub data: Bytes,
    pub content_type: String,
}

impl Avatar {
    /// Wrap stored bytes, deriving the content type from their signature
    pub fn from_bytes(data: Bytes) -> Self {
        let content_type = sniff_content_type(&data).to_string();
        Self { data, content_type }
    }
}

/// Detect the image type from magic bytes. Unknown data is served as JPEG,
/// which is what upstream returns by default.
pub fn sniff_content_type(data: &[u8]) -> &'static str {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        "image/gif"
    } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

/// Where a served image came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_header(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// Why a request was answered with a redirect instead of bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectReason {
    /// CDN delivery is configured
    Cdn,
    /// No hash could be derived; the configured default avatar
    Unresolved,
    /// Upstream has no custom avatar; its own default rendering
    NoAvatar,
    /// Upstream failed transiently; its original URL
    Transient,
}

/// What the proxy answers for one avatar request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvatarResponse {
    Image { avatar: Avatar, cache: CacheStatus },
    Redirect { location: String, reason: RedirectReason },
}

/// Outcome of the clear-all administrative action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub removed: usize,
    /// Avatars that could not be removed locally; still cached and not purged
    pub remove_failed: usize,
    pub purged: usize,
    pub purge_failed: usize,
}

/// Outcome of a single-hash purge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub removed: bool,
    pub cdn_purged: bool,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
}

/// Response body for the cleanup action
#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    #[serde(flatten)]
    pub report: CleanupReport,
    pub max_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_content_type() {
        assert_eq!(sniff_content_type(b"\x89PNG\r\n\x1a\n...."), "image/png");
        assert_eq!(sniff_content_type(b"GIF89a..."), "image/gif");
        assert_eq!(sniff_content_type(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(sniff_content_type(b"\xff\xd8\xff\xe0"), "image/jpeg");
        assert_eq!(sniff_content_type(b""), "image/jpeg");
    }

    #[test]
    fn test_cache_status_header() {
        assert_eq!(CacheStatus::Hit.as_header(), "HIT");
        assert_eq!(CacheStatus::Miss.as_header(), "MISS");
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            uptime_secs: 3600,
            cache: CacheStats {
                entries: 100,
                total_size: 50_000,
                hits: 500,
                misses: 50,
            },
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("3600"));
        assert!(json.contains("500"));
    }

    #[test]
    fn test_cleanup_response_flattens_report() {
        let response = CleanupResponse {
            report: CleanupReport {
                orphans_removed: 2,
                evicted: 3,
            },
            max_entries: 1000,
        };

        let json: serde_json::Value = serde_json::to_value(&response).unwrap();
        assert_eq!(json["orphans_removed"], 2);
        assert_eq!(json["evicted"], 3);
        assert_eq!(json["max_entries"], 1000);
    }
}
