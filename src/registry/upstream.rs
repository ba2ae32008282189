//! Upstream registry client.
//!
//! The [`UpstreamFetcher`] trait is the seam between the cache-aside logic
//! and the network: it downloads one metadata document or tarball and
//! persists it at a cache location.  [`RegistryClient`] is the reqwest-backed
//! implementation used in production.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::header;
use futures::StreamExt;
use tracing::{debug, instrument};
use url::Url;

use super::{PackageIdentity, TarballRequest};
use crate::cache::store;
use crate::config::UpstreamConfig;
use crate::metrics::{FetchOutcome, MetricsRegistry, ResourceKind};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Fetches registry resources and writes them into the local cache.
#[async_trait]
pub trait UpstreamFetcher: Send + Sync {
    /// Download the metadata document for `identity` into `cache_file`,
    /// replacing any previous copy.
    async fn fetch_metadata(&self, identity: &PackageIdentity, cache_file: &Path) -> Result<()>;

    /// Download the tarball described by `request` into `cache_file`.
    async fn fetch_tarball(&self, request: &TarballRequest, cache_file: &Path) -> Result<()>;

    /// Cheap reachability probe used by the health endpoint.
    async fn ping(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// URL construction
// ---------------------------------------------------------------------------

/// `{base}/{name}` or `{base}/@scope%2fname`.
pub fn metadata_url(base: &str, identity: &PackageIdentity) -> String {
    let base = base.trim_end_matches('/');
    match identity.scope() {
        Some(scope) => format!("{base}/{scope}%2f{}", identity.name()),
        None => format!("{base}/{}", identity.name()),
    }
}

/// `{base}/[@scope/]name/-/{name}-{version}.tgz`.
pub fn tarball_url(base: &str, request: &TarballRequest) -> String {
    let base = base.trim_end_matches('/');
    format!(
        "{base}/{}/-/{}",
        request.identity.full_name(),
        request.filename()
    )
}

// ---------------------------------------------------------------------------
// reqwest implementation
// ---------------------------------------------------------------------------

/// Production [`UpstreamFetcher`] talking HTTP to an npm-compatible registry.
#[derive(Clone)]
pub struct RegistryClient {
    http_client: reqwest::Client,
    base_url: String,
    metrics: MetricsRegistry,
}

impl RegistryClient {
    pub fn new(config: &UpstreamConfig, metrics: MetricsRegistry) -> Result<Self> {
        Url::parse(&config.url)
            .with_context(|| format!("invalid upstream registry URL: {}", config.url))?;

        let http_client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            http_client,
            base_url: config.url.trim_end_matches('/').to_owned(),
            metrics,
        })
    }

    async fn get(&self, url: &str, accept: &str) -> Result<reqwest::Response> {
        let resp = self
            .http_client
            .get(url)
            .header(header::ACCEPT, accept)
            .send()
            .await
            .with_context(|| format!("failed to reach upstream registry at {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("upstream registry returned {status} for {url}");
        }
        Ok(resp)
    }

    fn record(&self, kind: ResourceKind, started: Instant, result: &Result<()>) {
        let outcome = if result.is_ok() {
            FetchOutcome::Success
        } else {
            FetchOutcome::Failure
        };
        self.metrics.record_upstream_fetch(kind, outcome, started.elapsed());
    }
}

#[async_trait]
impl UpstreamFetcher for RegistryClient {
    #[instrument(skip(self, cache_file), fields(package = %identity))]
    async fn fetch_metadata(&self, identity: &PackageIdentity, cache_file: &Path) -> Result<()> {
        let started = Instant::now();
        let url = metadata_url(&self.base_url, identity);

        let result = async {
            let resp = self.get(&url, "application/json").await?;
            let body = resp
                .bytes()
                .await
                .with_context(|| format!("failed to read metadata body from {url}"))?;
            store::write_atomic(cache_file, &body).await
        }
        .await;

        self.record(ResourceKind::Metadata, started, &result);
        if result.is_ok() {
            debug!(%url, path = %cache_file.display(), "metadata cached from upstream");
        }
        result
    }

    #[instrument(skip(self, cache_file), fields(package = %request.identity, version = %request.version))]
    async fn fetch_tarball(&self, request: &TarballRequest, cache_file: &Path) -> Result<()> {
        let started = Instant::now();
        let url = tarball_url(&self.base_url, request);

        let result = async {
            let resp = self.get(&url, "application/octet-stream").await?;
            let stream = resp
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other));
            store::write_stream_atomic(cache_file, stream).await
        }
        .await;

        self.record(ResourceKind::Tarball, started, &result);
        if result.is_ok() {
            debug!(%url, path = %cache_file.display(), "tarball cached from upstream");
        }
        result
    }

    async fn ping(&self) -> Result<()> {
        let url = format!("{}/-/ping", self.base_url);
        self.get(&url, "application/json").await.map(|_| ())
    }
}
