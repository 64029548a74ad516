//! Rendezvous server: registers websocket clients, pairs them first come
//! first served, and relays `sdp`/`ice` frames between partners until one of
//! them leaves.

pub mod channel;
pub mod config;
pub mod registry;
pub mod routes;
pub mod state;
pub mod sweeper;
pub mod telemetry;
pub mod websocket;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, signal};
use tracing::info;

use crate::config::ServerConfig;
use crate::registry::Roulette;
use crate::state::AppState;

/// Binds the configured address and serves until Ctrl-C.
pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let state = AppState::new(Roulette::shared(), metrics);
    let sweeper = config
        .match_timeout
        .map(|max_wait| sweeper::spawn_match_sweeper(state.roulette.clone(), max_wait));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(listen_addr = %config.listen_addr, "roulette listening");

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    info!("shutdown complete");
    Ok(())
}

/// Serves `state` on an already bound listener. Used by tests that need an
/// ephemeral port.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, routes::router(state)).await
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
