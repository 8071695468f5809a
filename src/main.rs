use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use depotcache::cache::CacheStore;
use depotcache::config;
use depotcache::fetch::FetchEngine;
use depotcache::http;
use depotcache::metrics::Metrics;
use depotcache::registry::Converger;
use depotcache::upstream::{HttpStorageServer, StorageServer};
use depotcache::AppState;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "depotcache",
    about = "Read-through caching proxy for a content-addressed package ecosystem"
)]
struct Cli {
    /// YAML configuration file to load.
    #[arg(short, long, default_value = "/etc/depotcache/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState, listen: &str) -> Result<()> {
    let addr: std::net::SocketAddr = listen
        .parse()
        .with_context(|| format!("unparseable listen address: {listen}"))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("could not bind {addr}"))?;

    tracing::info!(%addr, "front door listening");

    axum::serve(listener, http::create_router(Arc::new(state)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("front door terminated with an error")
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Completes once the process is asked to stop: SIGINT anywhere, SIGTERM on
/// unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received SIGINT");
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
    let config = config::load_config(&cli.config)?;

    // ---- Tracing ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting depotcache");

    // ---- Cache directories ----
    let store = CacheStore::new(&config.storage.cache_dir, &config.storage.temp_dir);
    store.bootstrap()?;

    // ---- Upstream field ----
    let http_client = reqwest::Client::builder()
        .user_agent("depotcache/0.1")
        .connect_timeout(Duration::from_secs(10))
        .read_timeout(Duration::from_secs(60))
        .build()
        .context("could not construct the shared HTTP client")?;

    let servers: Vec<Arc<dyn StorageServer>> = config
        .upstreams
        .iter()
        .map(|base_url| {
            Arc::new(HttpStorageServer::new(
                base_url.clone(),
                http_client.clone(),
                config.fetch.head_timeout(),
            )) as Arc<dyn StorageServer>
        })
        .collect();

    tracing::info!(
        upstreams = servers.len(),
        registries = config.registries.len(),
        "upstream field initialised"
    );

    // ---- Core engine and convergence loop ----
    let metrics = Arc::new(Metrics::new());
    let engine = Arc::new(FetchEngine::new(
        store,
        servers.clone(),
        config.fetch.shard_count,
        Arc::clone(&metrics),
    ));
    let converger = Arc::new(Converger::new(
        Arc::clone(&engine),
        servers.clone(),
        config.registries.clone(),
        Arc::clone(&metrics),
    ));

    let state = AppState {
        engine,
        converger: Arc::clone(&converger),
        metrics,
        servers,
    };

    let convergence_handle = tokio::spawn({
        let converger = Arc::clone(&converger);
        let tick_interval = config.convergence.tick_interval();
        async move { converger.run(tick_interval).await }
    });

    // The HTTP server runs in the foreground; once it drains after a
    // shutdown signal, the convergence loop is stopped as well.
    run_http_server(state, &config.proxy.http_listen).await?;
    convergence_handle.abort();

    tracing::info!("depotcache shut down cleanly");
    Ok(())
}
