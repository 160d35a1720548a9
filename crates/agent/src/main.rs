//! NetSentry agent - device-log anomaly detection daemon
//!
//! Loads agent configs, restores deployed models and drives every agent
//! from one scheduler until SIGINT.

use anyhow::{Context, Result};
use netsentry_agent::{api, bootstrap, config::ServiceConfig};
use netsentry_lib::{
    agents::{AgentContext, AgentRegistry},
    health::{components, HealthRegistry},
    io::{JsonLinesAnomalySink, JsonLinesLogSource, MemoryStatusStore},
    model::{ModelAssignments, ModelLifecycleManager, ModelStoreConfig, OnnxLoader},
    observability::StructuredLogger,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = ServiceConfig::load()?;
    let logger = StructuredLogger::new(&config.service_name);
    info!(
        agents_dir = %config.agents_dir.display(),
        model_store = %config.model_store_dir.display(),
        log_dir = %config.log_dir.display(),
        "Service configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry
        .register_all(&[
            components::AGENT_REGISTRY,
            components::MODEL_MANAGER,
            components::LOG_SOURCE,
            components::ANOMALY_SINK,
        ])
        .await;
    if !config.log_dir.is_dir() {
        warn!(log_dir = %config.log_dir.display(), "Log directory does not exist yet");
    }

    let status_store = Arc::new(MemoryStatusStore::new());
    let models = Arc::new(
        ModelLifecycleManager::new(
            ModelStoreConfig::new(&config.model_store_dir),
            Arc::new(OnnxLoader),
            status_store.clone(),
            Arc::new(ModelAssignments::new()),
        )
        .context("failed to open model store")?
        .with_logger(logger.clone()),
    );
    let restored = models
        .restore_deployed()
        .await
        .context("failed to restore deployed models")?;
    info!(restored, "Deployed models restored");

    let ctx = AgentContext::new(
        Arc::new(JsonLinesLogSource::new(&config.log_dir)),
        Arc::new(JsonLinesAnomalySink::new(&config.anomaly_output)),
        status_store,
    )
    .with_models(models.clone())
    .with_logger(logger.clone());

    let registry = Arc::new(
        AgentRegistry::new(ctx).with_shutdown_timeout(config.shutdown_timeout()),
    );
    for agent_config in bootstrap::load_agent_configs(&config.agents_dir) {
        let id = agent_config.id.clone();
        if let Err(e) = registry.create_agent(agent_config) {
            warn!(agent_id = %id, error = %e, "Agent rejected");
        }
    }
    let active = registry.start_all().await;
    logger.log_startup(SERVICE_VERSION, registry.len());
    info!(registered = registry.len(), active, "Agents started");

    health_registry.observe_agents(&registry.list_agents()).await;
    health_registry.set_ready(true).await;

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        registry.clone(),
        models,
    ));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let driver = tokio::spawn(registry.clone().run(config.tick_interval(), shutdown_rx));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    let _ = shutdown_tx.send(());
    if let Err(e) = driver.await {
        warn!(error = %e, "Agent driver ended abnormally");
    }
    api_handle.abort();
    info!("Shutdown complete");

    Ok(())
}
