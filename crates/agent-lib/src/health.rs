//! Liveness and readiness of the detection service
//!
//! Components report a [`ComponentHealth`]; the overall status is the worst
//! of them. Agent and model health is derived from registry snapshots via
//! [`HealthRegistry::observe_agents`].

use crate::agents::{AgentStatus, AgentSummary, NO_MODEL_REASON};
use crate::error::CycleStage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Component names for health tracking
pub mod components {
    pub const AGENT_REGISTRY: &str = "agent_registry";
    pub const MODEL_MANAGER: &str = "model_manager";
    pub const LOG_SOURCE: &str = "log_source";
    pub const ANOMALY_SINK: &str = "anomaly_sink";
}

/// Ordered best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still serving, with reduced coverage
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            checked_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst component status; healthy when nothing is registered
    pub fn compute_status(components: &BTreeMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Shared component health table
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register components as healthy
    pub async fn register_all(&self, names: &[&str]) {
        let mut table = self.components.write().await;
        for name in names {
            table.insert(name.to_string(), ComponentHealth::healthy());
        }
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components.write().await.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Derive agent and model health from a registry listing.
    ///
    /// The agent registry is unhealthy when every started agent is in
    /// `error`, degraded when some are. The model manager is degraded while
    /// any agent waits for a model. The log source and anomaly sink are
    /// degraded while some agent's last cycle broke in their stage.
    pub async fn observe_agents(&self, agents: &[AgentSummary]) {
        let started: Vec<&AgentSummary> = agents
            .iter()
            .filter(|a| a.state.status != AgentStatus::Initialized)
            .collect();
        let failing = started
            .iter()
            .filter(|a| a.state.status == AgentStatus::Error)
            .count();
        let waiting: Vec<&str> = started
            .iter()
            .filter(|a| {
                a.state.status == AgentStatus::Inactive
                    && a.state.reason.as_deref() == Some(NO_MODEL_REASON)
            })
            .map(|a| a.id.as_str())
            .collect();

        let agent_health = if agents.is_empty() {
            ComponentHealth::degraded("no agents registered")
        } else if !started.is_empty() && failing == started.len() {
            ComponentHealth::unhealthy(format!("all {} agents failing", failing))
        } else if failing > 0 {
            ComponentHealth::degraded(format!("{} of {} agents failing", failing, started.len()))
        } else {
            ComponentHealth::healthy()
        };
        let model_health = if waiting.is_empty() {
            ComponentHealth::healthy()
        } else {
            ComponentHealth::degraded(format!("waiting for a model: {}", waiting.join(", ")))
        };

        let stage_health = |stage: CycleStage| {
            let broken: Vec<&str> = started
                .iter()
                .filter(|a| {
                    a.state.status == AgentStatus::Error && a.state.failed_stage == Some(stage)
                })
                .map(|a| a.id.as_str())
                .collect();
            if broken.is_empty() {
                ComponentHealth::healthy()
            } else {
                ComponentHealth::degraded(format!("failing for: {}", broken.join(", ")))
            }
        };
        let log_health = stage_health(CycleStage::Fetch);
        let sink_health = stage_health(CycleStage::Persist);

        let mut table = self.components.write().await;
        table.insert(components::AGENT_REGISTRY.to_string(), agent_health);
        table.insert(components::MODEL_MANAGER.to_string(), model_health);
        table.insert(components::LOG_SOURCE.to_string(), log_health);
        table.insert(components::ANOMALY_SINK.to_string(), sink_health);
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    /// Ready once initialized and no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("service not yet initialized".to_string()),
            };
        }
        let health = self.health().await;
        let unhealthy: Vec<&str> = health
            .components
            .iter()
            .filter(|(_, c)| !c.status.is_operational())
            .map(|(name, _)| name.as_str())
            .collect();
        if unhealthy.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("unhealthy: {}", unhealthy.join(", "))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentRuntimeState;

    fn summary(id: &str, status: AgentStatus, reason: Option<&str>) -> AgentSummary {
        AgentSummary {
            id: id.to_string(),
            name: id.to_string(),
            strategy: "rule".to_string(),
            model_version: None,
            state: AgentRuntimeState {
                status,
                reason: reason.map(str::to_string),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_worst_component_wins() {
        let registry = HealthRegistry::new();
        registry
            .register_all(&[components::LOG_SOURCE, components::MODEL_MANAGER])
            .await;
        registry.set_degraded(components::MODEL_MANAGER, "no deployed model").await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry.set_unhealthy(components::LOG_SOURCE, "log directory unreadable").await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_readiness_requires_init_and_no_unhealthy() {
        let registry = HealthRegistry::new();
        registry.register_all(&[components::LOG_SOURCE]).await;
        assert!(!registry.readiness().await.ready);

        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry.set_unhealthy(components::LOG_SOURCE, "gone").await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("unhealthy: log_source"));
    }

    #[tokio::test]
    async fn test_observe_agents_partial_failure() {
        let registry = HealthRegistry::new();
        registry
            .observe_agents(&[
                summary("a", AgentStatus::Active, None),
                summary("b", AgentStatus::Error, None),
                summary("c", AgentStatus::Inactive, Some(NO_MODEL_REASON)),
            ])
            .await;

        let health = registry.health().await;
        let agents = &health.components[components::AGENT_REGISTRY];
        assert_eq!(agents.status, ComponentStatus::Degraded);
        assert_eq!(agents.message.as_deref(), Some("1 of 3 agents failing"));
        let models = &health.components[components::MODEL_MANAGER];
        assert_eq!(models.message.as_deref(), Some("waiting for a model: c"));
    }

    #[tokio::test]
    async fn test_observe_agents_flags_failing_stage() {
        let registry = HealthRegistry::new();
        let mut broken = summary("sinkless", AgentStatus::Error, None);
        broken.state.failed_stage = Some(CycleStage::Persist);
        registry
            .observe_agents(&[broken, summary("ok", AgentStatus::Active, None)])
            .await;

        let health = registry.health().await;
        assert_eq!(
            health.components[components::ANOMALY_SINK].message.as_deref(),
            Some("failing for: sinkless")
        );
        assert_eq!(
            health.components[components::LOG_SOURCE].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_observe_agents_all_failing() {
        let registry = HealthRegistry::new();
        registry
            .observe_agents(&[
                summary("a", AgentStatus::Error, None),
                summary("b", AgentStatus::Initialized, None),
            ])
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
    }
}
