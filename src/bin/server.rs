// Fleet Orchestrator - Main Server
// Runs the worker loop, the hunt ticker and the HTTP surface in one process
// Run with: cargo run --bin server

//! # Fleet Orchestrator Server Binary
//!
//! This is the main executable of the orchestrator. It shows how the pieces
//! come together:
//!
//! ```text
//! main()
//!   ↓ loads
//! Settings (defaults → fleet.toml → FLEET__* environment)
//!   ↓ builds
//! FleetEngine (store, runner, handlers, hunt coordinator)
//!   ↓ starts
//! Worker loop + hunt ticker      HTTP server (axum)
//!   ↓ on Ctrl-C
//! HTTP server drains → worker finishes in-flight sessions → exit
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Graceful Shutdown
//! `HttpServer::run_until` takes any future as the shutdown signal. Here it is
//! `tokio::signal::ctrl_c()`; once it resolves the server stops accepting
//! connections and `main` shuts the background tasks down in order.

use dotenv::dotenv;
use fleet_orchestrator::{FleetEngine, HttpServer, Settings};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional; real deployments set the environment directly
    if let Err(e) = dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::load()?;
    info!("Starting fleet orchestrator");
    info!(
        backend = ?settings.storage.backend,
        max_concurrent_sessions = settings.worker.max_concurrent_sessions,
        lease_ttl_secs = settings.worker.lease_ttl_secs,
        hunt_tick_secs = settings.hunts.tick_interval_secs,
        "Settings loaded"
    );
    if settings.alerts.webhook_url.is_none() {
        warn!("No alert webhook configured; alerts are only logged");
    }

    let engine = FleetEngine::from_settings(&settings).await?;
    let background = engine.start_background();

    let server = HttpServer::builder()
        .settings(settings.server.clone())
        .engine(engine)
        .build()?;

    let served = server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await;

    background.shutdown().await;
    served?;
    info!("Fleet orchestrator stopped");
    Ok(())
}
