//! Fake upstream provider and CDN edge for tests

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Upstream serves [`JPEG_BYTES`] for this hash
pub const AVATAR_HASH: &str = "b58996c504c5638798eb6b511e6f49af";
/// Upstream answers 404 for this hash
pub const MISSING_HASH: &str = "00000000000000000000000000000000";
/// Upstream answers 503 for this hash
pub const FAILING_HASH: &str = "ffffffffffffffffffffffffffffffff";

pub const JPEG_BYTES: &[u8] = b"\xff\xd8\xff\xe0fake-jpeg-avatar";

pub struct FakeUpstream {
    pub base_url: String,
    hits: Arc<AtomicUsize>,
}

impl FakeUpstream {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct UpstreamState {
    hits: Arc<AtomicUsize>,
    delay: Duration,
}

/// Start a fake avatar provider at `{base_url}/{hash}`.
///
/// Hashes other than the named constants get a JPEG whose body ends with the hash.
pub async fn spawn_upstream(delay: Duration) -> FakeUpstream {
    let hits = Arc::new(AtomicUsize::new(0));
    let state = UpstreamState {
        hits: hits.clone(),
        delay,
    };
    let router = Router::new()
        .route("/avatar/{hash}", get(upstream_avatar))
        .with_state(state);

    let addr = serve(router).await;
    FakeUpstream {
        base_url: format!("http://{}/avatar", addr),
        hits,
    }
}

async fn upstream_avatar(State(state): State<UpstreamState>, Path(hash): Path<String>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(state.delay).await;

    match hash.as_str() {
        MISSING_HASH => StatusCode::NOT_FOUND.into_response(),
        FAILING_HASH => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        AVATAR_HASH => ([(header::CONTENT_TYPE, "image/jpeg")], JPEG_BYTES).into_response(),
        other => {
            let mut body = b"\xff\xd8\xff\xe0".to_vec();
            body.extend_from_slice(other.as_bytes());
            ([(header::CONTENT_TYPE, "image/jpeg")], body).into_response()
        }
    }
}

pub struct FakeCdn {
    pub base_url: String,
    requests: Arc<Mutex<Vec<(Method, String)>>>,
}

impl FakeCdn {
    /// Every (method, path) the edge received
    pub fn requests(&self) -> Vec<(Method, String)> {
        self.requests.lock().clone()
    }
}

#[derive(Clone)]
struct CdnState {
    requests: Arc<Mutex<Vec<(Method, String)>>>,
    status: StatusCode,
}

/// Start a fake CDN edge that answers every request with `status`
pub async fn spawn_cdn(status: StatusCode) -> FakeCdn {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let state = CdnState {
        requests: requests.clone(),
        status,
    };
    let router = Router::new().fallback(cdn_edge).with_state(state);

    let addr = serve(router).await;
    FakeCdn {
        base_url: format!("http://{}", addr),
        requests,
    }
}

async fn cdn_edge(State(state): State<CdnState>, method: Method, uri: Uri) -> StatusCode {
    state.requests.lock().push((method, uri.path().to_string()));
    state.status
}

async fn serve(router: Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}
