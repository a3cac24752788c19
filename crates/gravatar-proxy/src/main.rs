//! Gravatar Proxy - caching avatar proxy with CDN delivery
//!
//! Serves Gravatar images from a local disk cache and runs the periodic
//! cache cleanup.

use gravatar_proxy::error::{ProxyError, Result};
use gravatar_proxy::{start_server, Config, InMemoryUserDirectory, ProxyService, ServerState, SharedState};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter =
        EnvFilter::from_default_env().add_directive("gravatar_proxy=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting Gravatar Proxy...");

    let config = Config::from_env();
    info!("Port: {}", config.port);
    info!("Cache dir: {:?}", config.cache_dir);
    info!("Upstream: {}", config.upstream_url);
    info!("Max cache entries: {}", config.settings.max_cache_entries);
    match config.settings.cdn_base() {
        Some(cdn) => info!("CDN: {}", cdn),
        None => info!("CDN: disabled"),
    }

    // Account lookups belong to the embedding host; standalone, only hashes
    // and raw emails resolve
    let directory = Arc::new(InMemoryUserDirectory::new());
    let service = ProxyService::from_config(&config, directory).await?;

    spawn_cleanup(service.clone(), config.cleanup_interval);

    let state: SharedState = Arc::new(ServerState::new(service));

    start_server(state, config.port, shutdown_signal())
        .await
        .map_err(|e| ProxyError::Config(format!("Server error: {}", e)))?;

    info!("Gravatar Proxy stopped");
    Ok(())
}

/// Run cache cleanup every `period`, starting one period from now
fn spawn_cleanup(service: ProxyService, period: Duration) {
    if period.is_zero() {
        info!("Periodic cleanup disabled");
        return;
    }

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = service.cleanup().await {
                error!(error = %e, "Periodic cache cleanup failed");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
