//! Cache-aside decision logic for metadata and tarball requests.
//!
//! Metadata: with failover enabled the cached document is refreshed from
//! upstream on every request before it is served; without failover only an
//! existing cache file is served.
//!
//! Tarballs: a cached file is always served as-is.  On a miss the tarball is
//! fetched only when failover is enabled.  Independently, a tarball request
//! for a package whose metadata is not cached kicks off a detached,
//! best-effort metadata download so that the next metadata request is a hit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::coalesce::FetchCoalescer;
use super::store::CacheStore;
use crate::config::Config;
use crate::http::access_log::RequestLog;
use crate::http::handler::AppError;
use crate::metrics::{CacheStatus, FetchOutcome, MetricsRegistry, ResourceKind};
use crate::registry::patch::MetadataPatcher;
use crate::registry::upstream::UpstreamFetcher;
use crate::registry::{PackageIdentity, TarballRequest};

/// A cached tarball opened for streaming.
#[derive(Debug)]
pub struct CachedFile {
    pub path: PathBuf,
    pub file: tokio::fs::File,
    pub len: u64,
}

/// Orchestrates the cache store, upstream fetcher, and metadata patcher.
#[derive(Clone)]
pub struct CacheAside {
    store: CacheStore,
    fetcher: Arc<dyn UpstreamFetcher>,
    patcher: MetadataPatcher,
    failover: bool,
    coalescer: Option<FetchCoalescer>,
    metrics: MetricsRegistry,
}

impl CacheAside {
    pub fn new(
        config: &Config,
        fetcher: Arc<dyn UpstreamFetcher>,
        metrics: MetricsRegistry,
    ) -> anyhow::Result<Self> {
        let patcher = MetadataPatcher::new(
            &config.upstream.url,
            &config.proxy.public_url,
            &config.storage.registry_name,
        )?;
        Ok(Self {
            store: CacheStore::new(&config.storage),
            fetcher,
            patcher,
            failover: config.upstream.failover,
            coalescer: config.upstream.coalesce_fetches.then(FetchCoalescer::new),
            metrics,
        })
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn fetcher(&self) -> &Arc<dyn UpstreamFetcher> {
        &self.fetcher
    }

    pub fn failover(&self) -> bool {
        self.failover
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    /// Resolve the patched metadata document for `identity`.
    #[instrument(skip(self, log), fields(package = %identity))]
    pub async fn metadata(
        &self,
        identity: &PackageIdentity,
        log: &RequestLog,
    ) -> Result<Value, AppError> {
        let cache_file = self.store.metadata_path(identity);
        let cached = self.store.exists(&cache_file).await;

        if self.failover {
            // Refresh-ahead: upstream is consulted even when cached.
            self.classify(ResourceKind::Metadata, CacheStatus::MissFailover, log);
            debug!(cached, "refreshing metadata from upstream");
            self.fetch_metadata(identity, &cache_file)
                .await
                .map_err(AppError::Upstream)?;
        } else if cached {
            self.classify(ResourceKind::Metadata, CacheStatus::Hit, log);
        } else {
            self.classify(ResourceKind::Metadata, CacheStatus::MissNotFound, log);
            return Err(AppError::NotFound);
        }

        log.set_cache_file(&cache_file);
        let raw = self.store.read(&cache_file).await?;
        let document: Value = serde_json::from_str(&raw)
            .with_context(|| format!("cached metadata is not valid JSON: {}", cache_file.display()))
            .map_err(AppError::CacheCorruption)?;

        Ok(self.patcher.patch(&identity.full_name(), &document))
    }

    // -----------------------------------------------------------------------
    // Tarballs
    // -----------------------------------------------------------------------

    /// Resolve and open the cached tarball for `request`.
    #[instrument(skip(self, log), fields(package = %request.identity, version = %request.version))]
    pub async fn tarball(
        &self,
        request: &TarballRequest,
        log: &RequestLog,
    ) -> Result<CachedFile, AppError> {
        // Detached; never awaited and never affects this response.
        let _ = self.spawn_metadata_warm(&request.identity);

        let cache_file = self.store.tarball_path(request);

        if self.store.exists(&cache_file).await {
            self.classify(ResourceKind::Tarball, CacheStatus::Hit, log);
        } else if self.failover {
            self.classify(ResourceKind::Tarball, CacheStatus::MissFailover, log);
            self.fetch_tarball(request, &cache_file)
                .await
                .map_err(AppError::Upstream)?;
        } else {
            self.classify(ResourceKind::Tarball, CacheStatus::MissNotFound, log);
            return Err(AppError::NotFound);
        }

        log.set_cache_file(&cache_file);
        let (file, len) = self.store.open(&cache_file).await?;

        Ok(CachedFile {
            path: cache_file,
            file,
            len,
        })
    }

    /// Record how a request is being satisfied.  Runs before any fallible
    /// step, so failed requests are counted as well.
    fn classify(&self, kind: ResourceKind, status: CacheStatus, log: &RequestLog) {
        log.set_cache_status(status);
        self.metrics.record_request(kind, status);
    }

    /// Start a best-effort background download of `identity`'s metadata if
    /// failover is enabled.  The task only fetches when the metadata file is
    /// absent, and its failures are logged and dropped.
    pub(crate) fn spawn_metadata_warm(&self, identity: &PackageIdentity) -> Option<JoinHandle<()>> {
        if !self.failover {
            return None;
        }

        let this = self.clone();
        let identity = identity.clone();
        Some(tokio::spawn(async move {
            let cache_file = this.store.metadata_path(&identity);
            if this.store.exists(&cache_file).await {
                return;
            }
            match this.fetch_metadata(&identity, &cache_file).await {
                Ok(()) => {
                    debug!(package = %identity, "background metadata warm complete");
                    this.metrics.record_background_warm(FetchOutcome::Success);
                }
                Err(e) => {
                    warn!(package = %identity, error = %format!("{e:#}"), "background metadata warm failed");
                    this.metrics.record_background_warm(FetchOutcome::Failure);
                }
            }
        }))
    }

    // -----------------------------------------------------------------------
    // Upstream fetches (optionally coalesced)
    // -----------------------------------------------------------------------

    async fn fetch_metadata(&self, identity: &PackageIdentity, cache_file: &Path) -> anyhow::Result<()> {
        let Some(coalescer) = &self.coalescer else {
            return self.fetcher.fetch_metadata(identity, cache_file).await;
        };

        let fetcher = Arc::clone(&self.fetcher);
        let identity = identity.clone();
        let path = cache_file.to_path_buf();
        coalescer
            .run(cache_file.to_path_buf(), async move {
                fetcher.fetch_metadata(&identity, &path).await
            })
            .await
    }

    async fn fetch_tarball(&self, request: &TarballRequest, cache_file: &Path) -> anyhow::Result<()> {
        let Some(coalescer) = &self.coalescer else {
            return self.fetcher.fetch_tarball(request, cache_file).await;
        };

        let fetcher = Arc::clone(&self.fetcher);
        let request = request.clone();
        let path = cache_file.to_path_buf();
        coalescer
            .run(cache_file.to_path_buf(), async move {
                fetcher.fetch_tarball(&request, &path).await
            })
            .await
    }
}
