//! Integration tests for the daemon's HTTP endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use netsentry_agent::api::{create_router, AppState};
use netsentry_lib::{
    agents::{AgentConfig, AgentContext, AgentRegistry, CycleOutcome, ModelRef, Strategy},
    health::{components, HealthRegistry},
    io::{JsonLinesAnomalySink, JsonLinesLogSource, NoopStatusPublisher},
    model::{ModelAssignments, ModelLifecycleManager, ModelStoreConfig, OnnxLoader},
    LogEntry,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    _temp: TempDir,
    router: Router,
    state: Arc<AppState>,
}

fn write_auth_flood(log_dir: &Path) {
    std::fs::create_dir_all(log_dir).unwrap();
    let entry = LogEntry::new("wifi", Utc::now() - chrono::Duration::minutes(1))
        .with_entity("ap-1")
        .with_field("authFailures", json!(12));
    let line = serde_json::to_string(&entry).unwrap();
    std::fs::write(log_dir.join("wifi.jsonl"), format!("{}\n", line)).unwrap();
}

/// App with one rule agent. With `broken_sink` the anomaly output path is a
/// directory, so every cycle that detects something fails.
async fn setup_test_app(broken_sink: bool) -> TestApp {
    let temp = TempDir::new().unwrap();
    let log_dir = temp.path().join("logs");
    write_auth_flood(&log_dir);

    let output = temp.path().join("anomalies.jsonl");
    if broken_sink {
        std::fs::create_dir_all(&output).unwrap();
    }

    let publisher = Arc::new(NoopStatusPublisher);
    let models = Arc::new(
        ModelLifecycleManager::new(
            ModelStoreConfig::new(temp.path().join("store")),
            Arc::new(OnnxLoader),
            publisher.clone(),
            Arc::new(ModelAssignments::new()),
        )
        .unwrap(),
    );
    let ctx = AgentContext::new(
        Arc::new(JsonLinesLogSource::new(&log_dir)),
        Arc::new(JsonLinesAnomalySink::new(&output)),
        publisher,
    )
    .with_models(models.clone());
    let registry = Arc::new(AgentRegistry::new(ctx));
    registry
        .create_agent(AgentConfig::rule_based("wifi-rules"))
        .unwrap();
    registry.start_all().await;

    let health_registry = HealthRegistry::new();
    health_registry
        .register_all(&[components::LOG_SOURCE])
        .await;

    let state = Arc::new(AppState::new(health_registry, registry, models));
    TestApp {
        _temp: temp,
        router: create_router(state.clone()),
        state,
    }
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn run_cycle(app: &TestApp) -> CycleOutcome {
    let agent = app.state.agents.get("wifi-rules").unwrap();
    agent.run_analysis_cycle().await
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let app = setup_test_app(false).await;
    assert!(matches!(run_cycle(&app).await, CycleOutcome::Completed { anomalies: 1, .. }));

    let (status, body) = get(&app.router, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["components"]["agent_registry"]["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let app = setup_test_app(false).await;
    // An ML agent with no deployed model waits inactive
    let waiting = AgentConfig::rule_based("wifi-ml").with_strategy(Strategy::Ml {
        model: ModelRef::Slot("default".to_string()),
    });
    app.state.agents.create_agent(waiting).unwrap();
    app.state.agents.start_agent("wifi-ml").await.unwrap();

    let (status, body) = get(&app.router, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["components"]["model_manager"]["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_unavailable_when_all_agents_fail() {
    let app = setup_test_app(true).await;
    assert!(matches!(run_cycle(&app).await, CycleOutcome::Failed(_)));

    let (status, body) = get(&app.router, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["components"]["agent_registry"]["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_not_ready_until_initialized() {
    let app = setup_test_app(false).await;

    let (status, _) = get(&app.router, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    app.state.health_registry.set_ready(true).await;
    let (status, body) = get(&app.router, "/readyz").await;
    assert_eq!(status, StatusCode::OK);

    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_cycle_counters() {
    let app = setup_test_app(false).await;
    run_cycle(&app).await;

    let (status, body) = get(&app.router, "/metrics").await;
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("netsentry_cycles_completed_total"));
    assert!(text.contains("netsentry_anomalies_detected_total"));
}

#[tokio::test]
async fn test_agents_endpoint_lists_state() {
    let app = setup_test_app(false).await;
    run_cycle(&app).await;

    let (status, body) = get(&app.router, "/agents").await;
    assert_eq!(status, StatusCode::OK);

    let agents: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(agents[0]["id"], "wifi-rules");
    assert_eq!(agents[0]["strategy"], "rule");
    assert_eq!(agents[0]["state"]["status"], "active");
    assert_eq!(agents[0]["state"]["cyclesCompleted"], 1);
}

#[tokio::test]
async fn test_models_endpoint_empty_store() {
    let app = setup_test_app(false).await;

    let (status, body) = get(&app.router, "/models").await;
    assert_eq!(status, StatusCode::OK);

    let models: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(models, json!([]));
}
