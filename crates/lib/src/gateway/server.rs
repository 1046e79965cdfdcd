//! Gateway HTTP server (single port).

use crate::config::{self, GatewayConfig};
use crate::message::MessageId;
use crate::orchestrator::{OrchestratorError, OrchestratorHandle, Snapshot};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;

const PROTOCOL_VERSION: u32 = 1;

/// Shared state for HTTP handlers.
#[derive(Clone)]
struct GatewayState {
    port: u16,
    orchestrator: OrchestratorHandle,
}

#[derive(Debug, Deserialize)]
struct AutopilotToggle {
    active: bool,
}

/// Build the control-surface router for an orchestrator.
pub fn router(orchestrator: OrchestratorHandle, port: u16) -> Router {
    let state = GatewayState { port, orchestrator };
    Router::new()
        .route("/", get(health_http))
        .route("/messages", get(messages_http))
        .route("/autopilot", post(autopilot_http))
        .route("/messages/:id/retry", post(retry_http))
        .with_state(state)
}

/// Serve the control surface until `shutdown` resolves. Refuses a non-loopback bind unless
/// `allowRemote` is set, since the gateway has no auth of its own.
pub async fn run_gateway(
    config: &GatewayConfig,
    orchestrator: OrchestratorHandle,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let bind = config.bind.trim();
    if !config::is_loopback_bind(bind) && !config.allow_remote {
        anyhow::bail!(
            "refusing to bind gateway to {} (set gateway.allowRemote to expose it)",
            bind
        );
    }

    let app = router(orchestrator, config.port);
    let bind_addr = format!("{}:{}", bind, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining connections");
}

/// GET / returns a simple health JSON (for liveness checks).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let snap = state.orchestrator.snapshot();
    Json(json!({
        "runtime": if state.orchestrator.is_running() { "running" } else { "stopped" },
        "protocol": PROTOCOL_VERSION,
        "port": state.port,
        "autopilot": snap.active,
        "strategy": snap.strategy,
        "inFlight": snap.in_flight.len(),
    }))
}

/// GET /messages returns the latest snapshot.
async fn messages_http(State(state): State<GatewayState>) -> Json<Snapshot> {
    let snap = state.orchestrator.snapshot();
    Json((*snap).clone())
}

/// POST /autopilot `{ "active": bool }`. Activation is refused while the backend is unhealthy.
async fn autopilot_http(
    State(state): State<GatewayState>,
    Json(body): Json<AutopilotToggle>,
) -> Response {
    let result = if body.active {
        state.orchestrator.activate().await
    } else {
        state.orchestrator.deactivate().await
    };
    match result {
        Ok(()) => Json(json!({ "active": state.orchestrator.is_autopilot_active() })).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /messages/{id}/retry resets an errored message to `new`.
async fn retry_http(
    State(state): State<GatewayState>,
    Path(id): Path<MessageId>,
) -> Response {
    match state.orchestrator.retry(id.clone()).await {
        Ok(()) => Json(json!({ "id": id, "status": "new" })).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(e: OrchestratorError) -> Response {
    let status = match e {
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::NotRetryable { .. } | OrchestratorError::Transition(_) => {
            StatusCode::CONFLICT
        }
        OrchestratorError::Unhealthy(_) | OrchestratorError::Stopped => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    log::debug!("gateway: {} ({})", e, status);
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}
