mod cache;
mod config;
mod health;
mod http;
mod metrics;
mod registry;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cache::CacheAside;
use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::registry::upstream::{RegistryClient, UpstreamFetcher};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "npmcache", about = "Caching reverse proxy for npm registries")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/npmcache/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: CacheAside,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .proxy
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting npmcache");

    // ---- Ensure local cache directory exists ----
    tokio::fs::create_dir_all(&config.storage.path)
        .await
        .with_context(|| format!("failed to create cache dir: {}", config.storage.path))?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Upstream client ----
    let fetcher: Arc<dyn UpstreamFetcher> =
        Arc::new(RegistryClient::new(&config.upstream, metrics.clone())?);
    tracing::info!(
        upstream = %config.upstream.url,
        failover = config.upstream.failover,
        coalesce = config.upstream.coalesce_fetches,
        "upstream registry client initialised"
    );

    // ---- Cache controller ----
    let cache = CacheAside::new(&config, fetcher, metrics.clone())?;
    tracing::info!(
        path = %config.storage.path,
        registry = %config.storage.registry_name,
        "cache initialised"
    );

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        cache,
        metrics,
    };

    run_http_server(state).await?;

    tracing::info!("npmcache shut down cleanly");
    Ok(())
}
