//! HTTP server for the avatar proxy
//!
//! Provides /health, the /gravatar-proxy endpoints and the /admin actions.
//! Admin routes carry no authentication of their own; deployments restrict
//! access to them in front of this service.

use crate::config::Settings;
use crate::hash::ContentHash;
use crate::service::ProxyService;
use crate::types::{AvatarResponse, ClearReport, CleanupResponse, HealthResponse};
use avatar_blob_cache::CacheStats;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

const IMAGE_CACHE_CONTROL: &str = "public, max-age=86400";
/// Suffix of the path form the CDN pulls from
const CDN_ORIGIN_SUFFIX: &str = ".jpg";

/// Shared state for the HTTP server
pub struct ServerState {
    pub service: ProxyService,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(service: ProxyService) -> Self {
        Self {
            service,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Deserialize)]
pub struct HashQuery {
    #[serde(default)]
    hash: Option<String>,
}

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/gravatar-proxy", get(avatar_by_query))
        .route("/gravatar-proxy/", get(avatar_by_query))
        .route("/gravatar-proxy/{key}", get(avatar_by_path))
        .route("/gravatar-proxy/{key}/", get(avatar_by_path))
        .route("/admin/cache/stats", get(cache_stats))
        .route("/admin/cache/clear", post(clear_cache))
        .route("/admin/cache/cleanup", post(cleanup_cache))
        .route("/admin/cache/{hash}", delete(purge_hash))
        .route("/admin/settings", get(get_settings).put(update_settings))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server, returning once `shutdown` resolves
pub async fn start_server<F>(state: SharedState, port: u16, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: state.service.stats(),
    })
}

/// GET /gravatar-proxy/?hash={hash}
async fn avatar_by_query(
    State(state): State<SharedState>,
    Query(query): Query<HashQuery>,
) -> Response {
    let hash = query.hash.unwrap_or_default();
    render(state.service.serve_hash(&hash, true).await)
}

/// GET /gravatar-proxy/{hash}/ or, for CDN origin pulls, /gravatar-proxy/{hash}.jpg
async fn avatar_by_path(State(state): State<SharedState>, Path(key): Path<String>) -> Response {
    let response = match key.strip_suffix(CDN_ORIGIN_SUFFIX) {
        Some(hash) => state.service.serve_hash(hash, false).await,
        None => state.service.serve_hash(&key, true).await,
    };
    render(response)
}

fn render(response: AvatarResponse) -> Response {
    match response {
        AvatarResponse::Image { avatar, cache } => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, avatar.content_type)
            .header(header::CACHE_CONTROL, IMAGE_CACHE_CONTROL)
            .header("X-Cache", cache.as_header())
            .body(Body::from(avatar.data))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        AvatarResponse::Redirect { location, .. } => Redirect::temporary(&location).into_response(),
    }
}

async fn cache_stats(State(state): State<SharedState>) -> Json<CacheStats> {
    Json(state.service.stats())
}

async fn clear_cache(State(state): State<SharedState>) -> Json<ClearReport> {
    Json(state.service.clear_cache().await)
}

async fn cleanup_cache(State(state): State<SharedState>) -> Response {
    let max_entries = state.service.settings().get().max_cache_entries;
    match state.service.cleanup().await {
        Ok(report) => Json(CleanupResponse {
            report,
            max_entries,
        })
        .into_response(),
        Err(e) => {
            error!(error = %e, "Cache cleanup failed");
            internal_error("Cache cleanup failed")
        }
    }
}

async fn purge_hash(State(state): State<SharedState>, Path(raw): Path<String>) -> Response {
    let Some(hash) = ContentHash::parse(&raw) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Invalid hash".to_string(),
            }),
        )
            .into_response();
    };

    match state.service.purge(&hash).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            error!(hash = %hash, error = %e, "Failed to purge avatar");
            internal_error("Failed to purge avatar")
        }
    }
}

async fn get_settings(State(state): State<SharedState>) -> Json<Settings> {
    Json(state.service.settings().get())
}

async fn update_settings(
    State(state): State<SharedState>,
    Json(settings): Json<Settings>,
) -> Json<Settings> {
    let applied = state.service.settings().update(settings);
    info!(
        cdn_base_url = %applied.cdn_base_url,
        max_cache_entries = applied.max_cache_entries,
        "Settings updated"
    );
    Json(applied)
}

fn internal_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DEFAULT_AVATAR_URL};
    use crate::hash::InMemoryUserDirectory;
    use crate::test_support::{spawn_upstream, FakeUpstream, AVATAR_HASH, JPEG_BYTES};
    use axum::http::Request;
    use std::path::Path as FsPath;
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    async fn create_test_state(
        cache_dir: &FsPath,
        upstream: &FakeUpstream,
        cdn_base_url: &str,
    ) -> SharedState {
        let config = Config {
            cache_dir: cache_dir.to_path_buf(),
            upstream_url: upstream.base_url.clone(),
            settings: Settings {
                cdn_base_url: cdn_base_url.to_string(),
                ..Settings::default()
            },
            ..Config::default()
        };
        let service = ProxyService::from_config(&config, Arc::new(InMemoryUserDirectory::new()))
            .await
            .unwrap();
        Arc::new(ServerState::new(service))
    }

    async fn get(router: Router, uri: &str) -> Response {
        router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    fn location(response: &Response) -> &str {
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = tempdir().unwrap();
        let upstream = spawn_upstream(Duration::ZERO).await;
        let router = create_router(create_test_state(dir.path(), &upstream, "").await);

        let response = get(router, "/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["uptime_secs"].as_u64().is_some());
        assert!(json["cache"]["entries"].as_u64().is_some());
    }

    #[tokio::test]
    async fn test_query_form_miss_then_hit() {
        let dir = tempdir().unwrap();
        let upstream = spawn_upstream(Duration::ZERO).await;
        let router = create_router(create_test_state(dir.path(), &upstream, "").await);
        let uri = format!("/gravatar-proxy/?hash={}", AVATAR_HASH);

        let response = get(router.clone(), &uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "MISS");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        assert_eq!(body_bytes(response).await, JPEG_BYTES);

        let response = get(router, &uri).await;
        assert_eq!(response.headers()["x-cache"], "HIT");
        assert_eq!(upstream.hits(), 1);
    }

    #[tokio::test]
    async fn test_path_form() {
        let dir = tempdir().unwrap();
        let upstream = spawn_upstream(Duration::ZERO).await;
        let router = create_router(create_test_state(dir.path(), &upstream, "").await);

        let response = get(router, &format!("/gravatar-proxy/{}/", AVATAR_HASH)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, JPEG_BYTES);
    }

    #[tokio::test]
    async fn test_invalid_hash_redirects_to_default_avatar() {
        let dir = tempdir().unwrap();
        let upstream = spawn_upstream(Duration::ZERO).await;
        let router = create_router(create_test_state(dir.path(), &upstream, "").await);

        for uri in [
            "/gravatar-proxy/?hash=not-a-hash",
            "/gravatar-proxy/",
            "/gravatar-proxy/abc123/",
        ] {
            let response = get(router.clone(), uri).await;
            assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT, "{}", uri);
            assert_eq!(location(&response), DEFAULT_AVATAR_URL);
        }
        assert_eq!(upstream.hits(), 0);
    }

    #[tokio::test]
    async fn test_cdn_redirect_and_origin_pull() {
        let dir = tempdir().unwrap();
        let upstream = spawn_upstream(Duration::ZERO).await;
        let router = create_router(
            create_test_state(dir.path(), &upstream, "https://cdn.example.com").await,
        );

        let response = get(router.clone(), &format!("/gravatar-proxy/?hash={}", AVATAR_HASH)).await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            location(&response),
            format!("https://cdn.example.com/{}.jpg", AVATAR_HASH)
        );

        let response = get(router, &format!("/gravatar-proxy/{}.jpg", AVATAR_HASH)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, JPEG_BYTES);
    }

    #[tokio::test]
    async fn test_admin_clear() {
        let dir = tempdir().unwrap();
        let upstream = spawn_upstream(Duration::ZERO).await;
        let state = create_test_state(dir.path(), &upstream, "").await;
        let router = create_router(state.clone());

        get(router.clone(), &format!("/gravatar-proxy/?hash={}", AVATAR_HASH)).await;
        assert_eq!(state.service.stats().entries, 1);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/cache/clear")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["removed"], 1);
        assert_eq!(json["remove_failed"], 0);
        assert_eq!(state.service.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_admin_purge_rejects_invalid_hash() {
        let dir = tempdir().unwrap();
        let upstream = spawn_upstream(Duration::ZERO).await;
        let router = create_router(create_test_state(dir.path(), &upstream, "").await);

        let response = router
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/admin/cache/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_admin_settings_round_trip() {
        let dir = tempdir().unwrap();
        let upstream = spawn_upstream(Duration::ZERO).await;
        let state = create_test_state(dir.path(), &upstream, "").await;
        let router = create_router(state.clone());

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/admin/settings")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"cdn_base_url":"https://cdn.example.com","max_cache_entries":50}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = get(router, "/admin/settings").await;
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["cdn_base_url"], "https://cdn.example.com");
        assert_eq!(json["max_cache_entries"], 50);
        assert_eq!(state.service.settings().get().max_cache_entries, 50);
    }
}
