use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::signal;
use tracing::info;

use forge_hdr::cluster_client::{ClusterClient, StaticClusterClient};
use forge_hdr::config::Config;
use forge_hdr::supervisor::Supervisor;

#[derive(Clone)]
struct ServeState {
    supervisor: Arc<Supervisor>,
}

/// Boots the supervisor, binds the metrics/health router, and races the
/// whole thing against ctrl_c — the same client-connect -> bind -> spawn ->
/// select! -> graceful-shutdown shape as the teacher's `reconcile`/`watch`
/// commands, generalized from one controller loop to the full component
/// bundle.
pub async fn run(config: Config, dry_run: bool) -> Result<()> {
    let client: Arc<dyn ClusterClient> = if dry_run {
        Arc::new(StaticClusterClient::new(vec![]))
    } else {
        anyhow::bail!(
            "no live cluster client is wired into this build; pass --dry-run, or \
             implement `cluster_client::ClusterClient` for your cluster and wire it here"
        );
    };

    let bind_addr: SocketAddr = config.metrics.bind_addr.parse().context("invalid metrics.bind_addr")?;
    let supervisor = Arc::new(Supervisor::new(config, client));
    supervisor.start().context("supervisor failed to start")?;
    supervisor.spawn_background_loops();

    let state = ServeState { supervisor: supervisor.clone() };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("failed to bind metrics server")?;
    info!(addr = %bind_addr, "serve_metrics_server_started");

    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("metrics server crashed");
    });

    tokio::select! {
        _ = signal::ctrl_c() => info!("serve_shutdown_signal_received"),
        _ = server => info!("serve_metrics_server_exited"),
    }

    supervisor.stop();
    Ok(())
}

fn build_router(state: ServeState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/metrics/json", get(metrics_json_handler))
        .route("/health/live", get(live_handler))
        .route("/health/ready", get(ready_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<ServeState>) -> impl IntoResponse {
    (StatusCode::OK, state.supervisor.metrics.render_prometheus_text())
}

async fn metrics_json_handler(State(state): State<ServeState>) -> impl IntoResponse {
    match state.supervisor.metrics.latest_snapshot() {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => (StatusCode::OK, Json(serde_json::json!({}))).into_response(),
    }
}

async fn live_handler(State(state): State<ServeState>) -> impl IntoResponse {
    if state.supervisor.is_running() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn ready_handler(State(state): State<ServeState>) -> impl IntoResponse {
    if state.supervisor.health().healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
