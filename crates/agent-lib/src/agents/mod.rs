//! Detection agents and the registry that drives them
//!
//! Every agent exposes the same [`Agent`] contract. The three strategies
//! (rule, ML, hybrid) share scheduling, status handling and the
//! fetch → extract → classify → persist pipeline through [`CycleRunner`];
//! they differ only in how they score a vector.

mod binding;
mod config;
mod hybrid;
mod ml;
mod registry;
mod rule;
mod runner;

#[cfg(test)]
mod tests;

pub use config::{
    AgentConfig, AgentConfigFile, AnalysisRulesFile, FeatureExtractionFile, ModelRef, Strategy,
    DEFAULT_ANALYSIS_INTERVAL_SECS, DEFAULT_LOOKBACK_MINUTES, MAX_LOOKBACK_MINUTES,
};
pub use hybrid::HybridAgent;
pub use ml::MlAgent;
pub use registry::{AgentRegistry, AgentSummary, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_TICK_INTERVAL};
pub use rule::RuleAgent;
pub use runner::{CycleRunner, DetectionPlan};

use crate::error::{ConfigError, CycleStage};
use crate::io::{AnomalySink, LogSource, StatusPublisher};
use crate::model::ModelLifecycleManager;
use crate::observability::{AgentMetrics, StructuredLogger};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reason recorded when an ML agent has nothing to score with
pub const NO_MODEL_REASON: &str = "no valid model loaded";

/// Agent lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Initialized,
    Active,
    Analyzing,
    Inactive,
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Initialized => "initialized",
            AgentStatus::Active => "active",
            AgentStatus::Analyzing => "analyzing",
            AgentStatus::Inactive => "inactive",
            AgentStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Mutable runtime state, owned by one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRuntimeState {
    pub status: AgentStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Stage the last failed cycle broke in; cleared by a successful cycle
    pub failed_stage: Option<CycleStage>,
    /// Why the agent sits in its current status, when not self-evident
    pub reason: Option<String>,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
}

impl Default for AgentRuntimeState {
    fn default() -> Self {
        Self {
            status: AgentStatus::Initialized,
            last_run_at: None,
            last_error: None,
            failed_stage: None,
            reason: None,
            cycles_completed: 0,
            cycles_failed: 0,
        }
    }
}

/// Why a tick did not run a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Previous cycle still analyzing
    Overlap,
    NotStarted,
    Stopped,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Overlap => write!(f, "previous cycle still running"),
            SkipReason::NotStarted => write!(f, "agent not started"),
            SkipReason::Stopped => write!(f, "agent stopping"),
        }
    }
}

/// Result of one `run_analysis_cycle` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed { entities: usize, anomalies: usize },
    Skipped(SkipReason),
    /// No model to score with; the agent sits `inactive`
    ModelUnavailable,
    Failed(String),
}

/// Collaborators shared by every agent
#[derive(Clone)]
pub struct AgentContext {
    pub log_source: Arc<dyn LogSource>,
    pub sink: Arc<dyn AnomalySink>,
    pub publisher: Arc<dyn StatusPublisher>,
    /// Required by ML and hybrid agents
    pub models: Option<Arc<ModelLifecycleManager>>,
    pub logger: StructuredLogger,
    pub metrics: AgentMetrics,
}

impl AgentContext {
    pub fn new(
        log_source: Arc<dyn LogSource>,
        sink: Arc<dyn AnomalySink>,
        publisher: Arc<dyn StatusPublisher>,
    ) -> Self {
        Self {
            log_source,
            sink,
            publisher,
            models: None,
            logger: StructuredLogger::new("netsentry"),
            metrics: AgentMetrics::new(),
        }
    }

    pub fn with_models(mut self, models: Arc<ModelLifecycleManager>) -> Self {
        self.models = Some(models);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }
}

/// Common scheduling and status contract of every detection strategy
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    fn config(&self) -> &AgentConfig;

    /// Move to `active` (or `inactive` with a reason when the agent cannot
    /// score yet). Never fails.
    async fn start(&self) -> AgentStatus;

    /// Cooperative stop: no new cycles start, an in-flight cycle finishes
    async fn stop(&self);

    /// Stop, then wait up to `timeout` for the in-flight cycle. Returns
    /// whether the agent went idle in time.
    async fn stop_and_wait(&self, timeout: Duration) -> bool;

    async fn run_analysis_cycle(&self) -> CycleOutcome;

    fn status(&self) -> AgentRuntimeState;

    /// Started, not stopping, and its interval has elapsed since the last
    /// cycle start
    fn is_due(&self, now: Instant) -> bool;

    /// Version currently scored with, if any
    fn model_version(&self) -> Option<String>;
}

/// Build the agent selected by `config.strategy`
pub fn build_agent(config: AgentConfig, ctx: &AgentContext) -> Result<Arc<dyn Agent>, ConfigError> {
    let agent: Arc<dyn Agent> = match config.strategy.clone() {
        Strategy::Rule => Arc::new(RuleAgent::new(config, ctx)),
        Strategy::Ml { model } => Arc::new(MlAgent::new(config, model, ctx)?),
        Strategy::Hybrid {
            model,
            fallback_only,
        } => Arc::new(HybridAgent::new(config, model, fallback_only, ctx)?),
    };
    Ok(agent)
}
