use std::sync::Arc;
use std::time::Duration;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ResourceKind {
    Metadata,
    Tarball,
}

/// How a registry request was satisfied.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheStatus {
    /// Served from a file that was already cached.
    #[default]
    Hit,
    /// Upstream was consulted before serving.
    MissFailover,
    /// Not cached and upstream not consulted.
    MissNotFound,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "Hit",
            Self::MissFailover => "Miss-Failover",
            Self::MissNotFound => "Miss-NotFound",
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum FetchOutcome {
    Success,
    Failure,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub kind: ResourceKind,
    pub cache_status: CacheStatus,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FetchLabels {
    pub kind: ResourceKind,
    pub outcome: FetchOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KindLabels {
    pub kind: ResourceKind,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    pub requests_total: Family<RequestLabels, Counter>,
    pub upstream_fetch_total: Family<FetchLabels, Counter>,
    pub upstream_fetch_duration_seconds: Family<KindLabels, Histogram>,
    pub background_warm_total: Family<FetchLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "npmcache_requests",
            "Registry requests by resource kind and cache status",
            requests_total.clone(),
        );

        let upstream_fetch_total = Family::<FetchLabels, Counter>::default();
        registry.register(
            "npmcache_upstream_fetch",
            "Upstream registry fetches by resource kind and outcome",
            upstream_fetch_total.clone(),
        );

        let upstream_fetch_duration_seconds =
            Family::<KindLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.01, 2.0, 14))
            });
        registry.register(
            "npmcache_upstream_fetch_duration_seconds",
            "Upstream fetch latency in seconds",
            upstream_fetch_duration_seconds.clone(),
        );

        let background_warm_total = Family::<FetchLabels, Counter>::default();
        registry.register(
            "npmcache_background_metadata_warm",
            "Best-effort metadata warms triggered by tarball requests",
            background_warm_total.clone(),
        );

        Self {
            requests_total,
            upstream_fetch_total,
            upstream_fetch_duration_seconds,
            background_warm_total,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    pub fn record_request(&self, kind: ResourceKind, cache_status: CacheStatus) {
        self.metrics
            .requests_total
            .get_or_create(&RequestLabels { kind, cache_status })
            .inc();
    }

    pub fn record_upstream_fetch(&self, kind: ResourceKind, outcome: FetchOutcome, took: Duration) {
        self.metrics
            .upstream_fetch_total
            .get_or_create(&FetchLabels { kind, outcome })
            .inc();
        self.metrics
            .upstream_fetch_duration_seconds
            .get_or_create(&KindLabels { kind })
            .observe(took.as_secs_f64());
    }

    pub fn record_background_warm(&self, outcome: FetchOutcome) {
        self.metrics
            .background_warm_total
            .get_or_create(&FetchLabels {
                kind: ResourceKind::Metadata,
                outcome,
            })
            .inc();
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
