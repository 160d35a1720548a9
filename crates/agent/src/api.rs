//! HTTP API for health checks, Prometheus metrics and read-only status

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use netsentry_lib::{
    agents::AgentRegistry,
    health::{ComponentStatus, HealthRegistry},
    model::ModelLifecycleManager,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub agents: Arc<AgentRegistry>,
    pub models: Arc<ModelLifecycleManager>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        agents: Arc<AgentRegistry>,
        models: Arc<ModelLifecycleManager>,
    ) -> Self {
        Self {
            health_registry,
            agents,
            models,
        }
    }
}

/// 200 while healthy or degraded, 503 when unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state
        .health_registry
        .observe_agents(&state.agents.list_agents())
        .await;
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state
        .health_registry
        .observe_agents(&state.agents.list_agents())
        .await;
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn list_agents(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.agents.list_agents())
}

async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    match state.models.list_versions() {
        Ok(versions) => Json(versions).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to read model registry");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/agents", get(list_agents))
        .route("/models", get(list_models))
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
