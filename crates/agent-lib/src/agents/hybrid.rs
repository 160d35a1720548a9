use super::binding::ModelBinding;
use super::{Agent, AgentConfig, AgentContext, AgentRuntimeState, AgentStatus, CycleOutcome};
use super::{CycleRunner, DetectionPlan, ModelRef};
use crate::error::ConfigError;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Rules plus model. With `fallback_only` the rules run only when the
/// model path fails or is unsupported; otherwise both run on every vector.
/// A missing model degrades to rules, never to `inactive`.
pub struct HybridAgent {
    runner: CycleRunner,
    binding: ModelBinding,
    fallback_only: bool,
}

impl HybridAgent {
    pub fn new(
        config: AgentConfig,
        model: ModelRef,
        fallback_only: bool,
        ctx: &AgentContext,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            binding: ModelBinding::new(model, ctx)?,
            runner: CycleRunner::new(config, ctx),
            fallback_only,
        })
    }

    pub fn fallback_only(&self) -> bool {
        self.fallback_only
    }

    fn plan(&self) -> DetectionPlan {
        match self.binding.current() {
            Some(model) if self.fallback_only => DetectionPlan::Fallback(model),
            Some(model) => DetectionPlan::Augmented(model),
            None => DetectionPlan::Rules,
        }
    }
}

#[async_trait]
impl Agent for HybridAgent {
    fn id(&self) -> &str {
        self.runner.id()
    }

    fn config(&self) -> &AgentConfig {
        self.runner.config()
    }

    async fn start(&self) -> AgentStatus {
        if let Err(detail) = self.binding.load().await {
            warn!(
                agent_id = %self.runner.id(),
                model = %self.binding.describe(),
                error = %detail,
                "Model unavailable, running rules only"
            );
        } else {
            info!(
                agent_id = %self.runner.id(),
                model = %self.binding.describe(),
                fallback_only = self.fallback_only,
                "Hybrid model bound"
            );
        }
        self.runner
            .note_model(self.binding.current().as_ref().map(|m| m.version_id.as_str()));
        self.runner.start(Ok(())).await
    }

    async fn stop(&self) {
        self.runner.stop().await
    }

    async fn stop_and_wait(&self, timeout: Duration) -> bool {
        self.runner.stop_and_wait(timeout).await
    }

    async fn run_analysis_cycle(&self) -> CycleOutcome {
        self.runner.run_cycle(|| Ok(self.plan())).await
    }

    fn status(&self) -> AgentRuntimeState {
        self.runner.state()
    }

    fn is_due(&self, now: Instant) -> bool {
        self.runner.is_due(now)
    }

    fn model_version(&self) -> Option<String> {
        self.runner.current_model()
    }
}
