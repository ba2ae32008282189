//! Main axum router and HTTP request handlers for the npm caching proxy.
//!
//! Routes:
//! - `GET /{name}`                          - package metadata
//! - `GET /@{scope}/{name}`                 - scoped package metadata
//! - `GET /[@{scope}/]{name}/-/{file}.tgz`  - package tarball
//! - `GET /-/ping`                          - npm ping
//! - `GET /-/healthz`                       - Health check
//! - `GET /-/metrics`                       - Prometheus metrics
//!
//! Anything else answers 404 with an empty JSON object, which is what npm
//! clients expect from a registry for an unknown package.

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::State,
    http::{StatusCode, Uri, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, instrument, warn};

use super::access_log::{self, RequestLog};
use super::route::{self, RegistryRoute};
use crate::AppState;
use crate::cache::CachedFile;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let routes = Router::new()
        .route("/-/ping", get(handle_ping))
        .route("/-/healthz", get(handle_health))
        .route("/-/metrics", get(handle_metrics))
        .route("/{*path}", get(handle_registry))
        .fallback(handle_not_found)
        .with_state(state);

    // Path rewriting has to happen before route matching, so the registry
    // routes sit behind an outer router whose layers see every request.
    Router::new()
        .fallback_service(routes)
        .layer(middleware::from_fn(access_log::log_request))
        .layer(middleware::from_fn(route::decode_escaped_slash))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Metadata and tarball requests.
#[instrument(skip(state, log, uri), fields(path = %uri.path()))]
async fn handle_registry(
    State(state): State<Arc<AppState>>,
    Extension(log): Extension<RequestLog>,
    uri: Uri,
) -> Result<Response, AppError> {
    match RegistryRoute::parse(uri.path())? {
        RegistryRoute::Metadata(identity) => {
            let document = state.cache.metadata(&identity, &log).await?;
            Ok(Json(document).into_response())
        }
        RegistryRoute::Tarball(request) => {
            let cached = state.cache.tarball(&request, &log).await?;
            Ok(serve_tarball(cached))
        }
    }
}

/// `GET /-/ping`
async fn handle_ping() -> Json<serde_json::Value> {
    Json(json!({}))
}

/// `GET /-/healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    crate::health::health_report(&state.cache).await
}

/// `GET /-/metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let body = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
        .into_response())
}

async fn handle_not_found() -> AppError {
    AppError::NotFound
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Stream a cached tarball back to the client unchanged.
fn serve_tarball(cached: CachedFile) -> Response {
    debug!(path = %cached.path.display(), len = cached.len, "streaming cached tarball");
    let body = Body::from_stream(ReaderStream::new(cached.file));
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (header::CONTENT_LENGTH, cached.len.to_string()),
        ],
        body,
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error that converts into an HTTP response.
#[derive(Debug)]
pub enum AppError {
    /// Unknown route, or a package/tarball that is not cached and will not
    /// be fetched.
    NotFound,
    /// The path has a registry shape but its components are unusable.
    MalformedRequest(String),
    /// The upstream registry could not supply the resource.
    Upstream(anyhow::Error),
    /// A cached metadata file is not valid JSON.
    CacheCorruption(anyhow::Error),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, Json(json!({}))).into_response(),
            AppError::MalformedRequest(msg) => {
                warn!(%msg, "malformed registry request");
                (StatusCode::BAD_REQUEST, msg).into_response()
            }
            AppError::Upstream(err) => {
                error!(error = %format!("{err:#}"), "upstream fetch failed");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")).into_response()
            }
            AppError::CacheCorruption(err) => {
                error!(error = %format!("{err:#}"), "corrupted cache entry");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")).into_response()
            }
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use axum::body::to_bytes;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::cache::CacheAside;
    use crate::cache::store::write_atomic;
    use crate::config::{Config, parse_config};
    use crate::metrics::MetricsRegistry;
    use crate::registry::upstream::mock::MockFetcher;
    use crate::registry::{PackageIdentity, TarballRequest};

    const MYLIB_DOC: &str = r#"{
        "name": "@myorg/mylib",
        "versions": {
            "2.0.0": { "dist": { "tarball": "https://registry.npmjs.org/@myorg/mylib/-/mylib-2.0.0.tgz" } }
        }
    }"#;

    struct Harness {
        _tmp: tempfile::TempDir,
        state: Arc<AppState>,
        fetcher: Arc<MockFetcher>,
    }

    impl Harness {
        fn new(failover: bool, fetcher: MockFetcher) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let config: Config = parse_config(&format!(
                r#"
proxy:
  public_url: "http://proxy.local:8080/"
upstream:
  url: "https://registry.npmjs.org"
  failover: {failover}
storage:
  path: "{}"
"#,
                tmp.path().display()
            ))
            .unwrap();

            let fetcher = Arc::new(fetcher);
            let metrics = MetricsRegistry::new();
            let cache = CacheAside::new(&config, Arc::clone(&fetcher) as _, metrics.clone()).unwrap();
            let state = Arc::new(AppState {
                config: Arc::new(config),
                cache,
                metrics,
            });
            Self {
                _tmp: tmp,
                state,
                fetcher,
            }
        }

        fn root(&self) -> &Path {
            &self.state.cache.store().base_path
        }

        async fn seed_metadata(&self, identity: &PackageIdentity, body: &str) {
            let path = self.state.cache.store().metadata_path(identity);
            write_atomic(&path, body.as_bytes()).await.unwrap();
        }

        async fn seed_tarball(&self, request: &TarballRequest, body: &[u8]) {
            let path = self.state.cache.store().tarball_path(request);
            write_atomic(&path, body).await.unwrap();
        }

        async fn get(&self, uri: &str) -> (StatusCode, Vec<u8>) {
            let response = create_router(Arc::clone(&self.state))
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            let status = response.status();
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            (status, body.to_vec())
        }
    }

    fn mylib() -> PackageIdentity {
        PackageIdentity::scoped("@myorg", "mylib").unwrap()
    }

    #[tokio::test]
    async fn cached_metadata_is_served_patched() {
        let h = Harness::new(false, MockFetcher::failing());
        h.seed_metadata(&mylib(), MYLIB_DOC).await;

        let (status, body) = h.get("/@myorg/mylib").await;
        assert_eq!(status, StatusCode::OK);
        let doc: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            doc["versions"]["2.0.0"]["dist"]["tarball"],
            "http://proxy.local:8080/@myorg/mylib/-/mylib-2.0.0.tgz"
        );
    }

    #[tokio::test]
    async fn escaped_scope_separator_is_decoded() {
        let h = Harness::new(false, MockFetcher::failing());
        h.seed_metadata(&mylib(), MYLIB_DOC).await;

        for uri in ["/@myorg%2fmylib", "/@myorg%2Fmylib"] {
            let (status, _) = h.get(uri).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
        }
    }

    #[tokio::test]
    async fn metadata_miss_without_failover_is_empty_404() {
        let h = Harness::new(false, MockFetcher::serving(MYLIB_DOC, b""));

        let (status, body) = h.get("/left-pad").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, b"{}");
        assert_eq!(h.fetcher.metadata_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failover_fetches_metadata_even_when_cached() {
        let h = Harness::new(true, MockFetcher::serving(MYLIB_DOC, b""));
        h.seed_metadata(&mylib(), r#"{"name":"stale"}"#).await;

        let (status, body) = h.get("/@myorg/mylib").await;
        assert_eq!(status, StatusCode::OK);
        let doc: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(doc["name"], "@myorg/mylib");

        h.get("/@myorg/mylib").await;
        assert_eq!(h.fetcher.metadata_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cached_tarball_is_byte_identical_across_requests() {
        let h = Harness::new(false, MockFetcher::failing());
        let id = PackageIdentity::unscoped("left-pad").unwrap();
        let req = TarballRequest::from_filename(id, "left-pad-1.3.0.tgz").unwrap();
        let bytes: Vec<u8> = (0..=255).collect();
        h.seed_tarball(&req, &bytes).await;

        let (s1, b1) = h.get("/left-pad/-/left-pad-1.3.0.tgz").await;
        let (s2, b2) = h.get("/left-pad/-/left-pad-1.3.0.tgz").await;
        assert_eq!((s1, s2), (StatusCode::OK, StatusCode::OK));
        assert_eq!(b1, bytes);
        assert_eq!(b1, b2);
        assert_eq!(h.fetcher.tarball_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tarball_response_headers() {
        let h = Harness::new(false, MockFetcher::failing());
        let req = TarballRequest::from_filename(mylib(), "mylib-2.0.0.tgz").unwrap();
        h.seed_tarball(&req, b"abc").await;

        let response = create_router(Arc::clone(&h.state))
            .oneshot(
                Request::get("/@myorg/mylib/-/mylib-2.0.0.tgz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "3");
    }

    #[tokio::test]
    async fn tarball_without_version_is_bad_request() {
        let h = Harness::new(true, MockFetcher::serving(MYLIB_DOC, b"x"));

        let (status, _) = h.get("/left-pad/-/left-pad.tgz").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(h.fetcher.tarball_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unmatched_routes_are_empty_404() {
        let h = Harness::new(true, MockFetcher::serving(MYLIB_DOC, b"x"));

        for uri in ["/a/b/c", "/", "/-/whoami"] {
            let (status, body) = h.get(uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(body, b"{}");
        }
    }

    #[tokio::test]
    async fn upstream_failure_is_500_with_message() {
        let h = Harness::new(true, MockFetcher::failing());

        let (status, body) = h.get("/left-pad").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(String::from_utf8(body).unwrap().contains("503"));
    }

    #[tokio::test]
    async fn corrupted_metadata_is_500() {
        let h = Harness::new(false, MockFetcher::failing());
        let id = PackageIdentity::unscoped("left-pad").unwrap();
        h.seed_metadata(&id, "{\"name\":").await;

        let (status, body) = h.get("/left-pad").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(String::from_utf8(body).unwrap().contains("not valid JSON"));
    }

    #[tokio::test]
    async fn tarball_request_warms_missing_metadata() {
        let h = Harness::new(true, MockFetcher::serving(MYLIB_DOC, b"tgz"));

        let (status, body) = h.get("/@myorg/mylib/-/mylib-2.0.0.tgz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"tgz");

        // The warm runs detached; wait for it to land.
        let metadata = h.root().join("npmjs/@myorg/mylib/.cache.json");
        tokio::time::timeout(Duration::from_secs(5), async {
            while !metadata.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.fetcher.metadata_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ping_returns_empty_object() {
        let h = Harness::new(false, MockFetcher::failing());
        let (status, body) = h.get("/-/ping").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"{}");
    }

    #[tokio::test]
    async fn healthz_reports_upstream_state() {
        let h = Harness::new(true, MockFetcher::failing());
        let (status, body) = h.get("/-/healthz").await;
        assert_eq!(status, StatusCode::OK);
        let report: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(report["status"], "degraded");
        assert_eq!(report["checks"]["cache"]["ok"], true);
    }

    #[tokio::test]
    async fn metrics_count_requests() {
        let h = Harness::new(false, MockFetcher::failing());
        h.get("/left-pad").await;

        let (status, body) = h.get("/-/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("cache_status=\"MissNotFound\""));
    }
}
