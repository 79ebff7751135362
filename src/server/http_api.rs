// src/server/http_api.rs

//! The HTTP query surface and Prometheus exporter: read-only views over the
//! resource view, the named-instance index, and resource groups.

use crate::core::metrics::gather_metrics;
use crate::core::state::ServerState;
use axum::extract::Query;
use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

async fn resources_handler(state: Arc<ServerState>) -> impl IntoResponse {
    Json(state.view.snapshot().units)
}

async fn named_instances_handler(state: Arc<ServerState>) -> impl IntoResponse {
    Json(state.registry.list_named())
}

async fn resource_group_handler(
    state: Arc<ServerState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(name) = params.get("name") else {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({
            "error": "missing 'name' query parameter"
        })));
    };
    match state.rgroups.get(name) {
        Some(record) => {
            let snapshot = state.view.snapshot();
            let units: Vec<_> = snapshot
                .units
                .into_iter()
                .filter(|u| record.unit_ids.contains(&u.unit_id))
                .collect();
            (StatusCode::OK, Json(serde_json::json!({ "name": record.name, "units": units })))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("resource group {name} does not exist") })),
        ),
    }
}

async fn metrics_handler(state: Arc<ServerState>) -> impl IntoResponse {
    crate::core::metrics::RESOURCE_UNITS.set(state.view.unit_count() as f64);
    crate::core::metrics::TRACKED_INSTANCES.set(state.registry.len() as f64);
    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Runs the HTTP server exposing the query endpoints and /metrics.
pub async fn run_http_api(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let port = {
        let config = state.config.lock().await;
        config.metrics.port
    };

    let app = Router::new()
        .route(
            "/global-scheduler/resources",
            get({
                let state = state.clone();
                move || resources_handler(state.clone())
            }),
        )
        .route(
            "/instance-manager/named-ins",
            get({
                let state = state.clone();
                move || named_instances_handler(state.clone())
            }),
        )
        .route(
            "/resource-group/rgroup",
            get({
                let state = state.clone();
                move |query: Query<HashMap<String, String>>| {
                    resource_group_handler(state.clone(), query)
                }
            }),
        )
        .route(
            "/metrics",
            get({
                let state = state.clone();
                move || metrics_handler(state.clone())
            }),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("HTTP query surface listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind HTTP query surface on port {}: {}", port, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("HTTP query surface shutting down");
        })
        .await
    {
        error!("HTTP query surface failed: {}", e);
    }
}
