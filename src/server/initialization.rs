// src/server/initialization.rs

//! Assembles the server: shared state, background tasks, the HTTP query
//! surface, and the TCP listener, then runs until ctrl-c.

use super::{connection_loop, http_api, spawner};
use crate::config::Config;
use crate::core::state::ServerState;
use anyhow::{Context, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

/// Boots the control plane and serves until interrupted.
pub async fn run(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    let listen_addr = format!("{}:{}", config.host, config.port);
    let metrics_enabled = config.metrics.enabled;

    let init = ServerState::initialize_default(config, log_reload_handle)
        .await
        .context("failed to initialize server state")?;
    let state = init.state.clone();
    let shutdown_tx = init.shutdown_tx.clone();

    spawner::spawn_background_tasks(state.clone(), init.scheduler_rx, &shutdown_tx).await;

    if metrics_enabled {
        let http_state = state.clone();
        let http_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            http_api::run_http_api(http_state, http_shutdown).await;
        });
    }

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!("Stratus control plane listening on {}", listen_addr);

    let accept_state = state.clone();
    let accept_shutdown = shutdown_tx.subscribe();
    let accept = tokio::spawn(async move {
        connection_loop::run_accept_loop(accept_state, listener, accept_shutdown).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    state.is_shutting_down.store(true, Ordering::SeqCst);
    let _ = shutdown_tx.send(());
    let _ = accept.await;
    Ok(())
}
