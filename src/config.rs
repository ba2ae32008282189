use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Process configuration, read once at startup and shared immutably.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub upstream: UpstreamConfig,
    pub storage: StorageConfig,
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    /// Base URL that npm clients use to reach this proxy.  Tarball URLs in
    /// served metadata are rewritten to live under it.
    pub public_url: String,
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// Upstream registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Root URL of the upstream registry (e.g. `https://registry.npmjs.org`).
    #[serde(default = "default_upstream_url")]
    pub url: String,
    /// Consult the upstream registry on every metadata request and on
    /// tarball cache misses.  When disabled the proxy only serves what is
    /// already on disk.
    #[serde(default, alias = "enable_npm_failover")]
    pub failover: bool,
    /// Per-request timeout (seconds) for upstream fetches.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Share a single in-flight upstream fetch between concurrent requests
    /// for the same cache file.
    #[serde(default)]
    pub coalesce_fetches: bool,
    /// `User-Agent` sent to the upstream registry.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_upstream_url() -> String {
    "https://registry.npmjs.org".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_user_agent() -> String {
    concat!("npmcache/", env!("CARGO_PKG_VERSION")).to_string()
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the on-disk cache.
    pub path: String,
    /// Namespace directory under `path` for this registry's packages.
    #[serde(default = "default_registry_name", alias = "registry_namespace")]
    pub registry_name: String,
}

fn default_registry_name() -> String {
    "npmjs".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("invalid YAML config")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.storage.path.is_empty(),
        "storage.path must not be empty"
    );
    anyhow::ensure!(
        !config.storage.registry_name.is_empty()
            && !config.storage.registry_name.contains(['/', '\\'])
            && config.storage.registry_name != "..",
        "storage.registry_name must be a single path component"
    );
    anyhow::ensure!(
        config.upstream.request_timeout_secs > 0,
        "upstream.request_timeout_secs must be positive"
    );
    url::Url::parse(&config.upstream.url)
        .with_context(|| format!("invalid upstream.url: {}", config.upstream.url))?;
    url::Url::parse(&config.proxy.public_url)
        .with_context(|| format!("invalid proxy.public_url: {}", config.proxy.public_url))?;
    config
        .proxy
        .http_listen
        .parse::<std::net::SocketAddr>()
        .with_context(|| format!("invalid proxy.http_listen: {}", config.proxy.http_listen))?;
    Ok(())
}
