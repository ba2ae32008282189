use std::path::Path;
use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::cache::CacheAside;
use crate::registry::upstream::UpstreamFetcher;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub cache: CheckResult,
    pub upstream: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn skipped(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// The cache root must be a writable directory.
async fn check_cache(root: &Path) -> CheckResult {
    let probe = root.join(format!(".healthz.{}", uuid::Uuid::new_v4().simple()));
    match tokio::fs::write(&probe, b"ok").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&probe).await;
            CheckResult::healthy()
        }
        Err(e) => CheckResult::unhealthy(format!("cache dir {} not writable: {e}", root.display())),
    }
}

/// Upstream reachability only matters when failover is enabled.
async fn check_upstream(fetcher: &Arc<dyn UpstreamFetcher>, failover: bool) -> CheckResult {
    if !failover {
        return CheckResult::skipped("failover disabled");
    }
    match fetcher.ping().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("{e:#}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.cache.ok {
        // Nothing can be served without the cache.
        HealthStatus::Unhealthy
    } else if !checks.upstream.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Handler body
// ---------------------------------------------------------------------------

/// Run all checks.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_report(cache: &CacheAside) -> Response {
    let (cache_check, upstream) = tokio::join!(
        check_cache(&cache.store().base_path),
        check_upstream(cache.fetcher(), cache.failover()),
    );

    let checks = HealthChecks {
        cache: cache_check,
        upstream,
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body)).into_response()
}
