//! livetrack-gateway server entry point.
//!
//! Starts the Axum HTTP server with REST and WebSocket endpoints plus the
//! broadcaster and heartbeat background tasks.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use livetrack_gateway::api;
use livetrack_gateway::app_state::AppState;
use livetrack_gateway::auth::{IdentityValidator, StaticTokenValidator};
use livetrack_gateway::clock::SystemClock;
use livetrack_gateway::config::GatewayConfig;
use livetrack_gateway::resilience::{HttpSnapshotProvider, NoSnapshotProvider, SnapshotProvider};
use livetrack_gateway::service::DistributionService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = GatewayConfig::from_env()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    tracing::info!(addr = %config.listen_addr, "starting livetrack-gateway");

    // Collaborators
    let validator: Arc<dyn IdentityValidator> =
        Arc::new(StaticTokenValidator::parse(&config.auth_tokens).context("AUTH_TOKENS")?);
    let snapshots: Arc<dyn SnapshotProvider> = match config.snapshot_base_url.as_deref() {
        Some(base) => Arc::new(HttpSnapshotProvider::new(base)),
        None => {
            tracing::warn!("SNAPSHOT_BASE_URL unset, widgets start without snapshots");
            Arc::new(NoSnapshotProvider)
        }
    };

    // Build service layer
    let service = Arc::new(DistributionService::new(
        &config,
        validator,
        snapshots,
        Arc::new(SystemClock),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = service.spawn_background_tasks(shutdown_rx);

    // Start server
    let app = api::build_app(AppState::new(service));
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    tasks.join().await;
    tracing::info!("stopped");

    Ok(())
}
