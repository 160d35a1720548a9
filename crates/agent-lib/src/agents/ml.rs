use super::binding::ModelBinding;
use super::{Agent, AgentConfig, AgentContext, AgentRuntimeState, AgentStatus, CycleOutcome};
use super::{CycleRunner, DetectionPlan, ModelRef, NO_MODEL_REASON};
use crate::error::ConfigError;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::warn;

/// Model scores only. Without a loadable model the agent stays `inactive`
/// and every cycle reports [`CycleOutcome::ModelUnavailable`].
pub struct MlAgent {
    runner: CycleRunner,
    binding: ModelBinding,
}

impl MlAgent {
    pub fn new(
        config: AgentConfig,
        model: ModelRef,
        ctx: &AgentContext,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            binding: ModelBinding::new(model, ctx)?,
            runner: CycleRunner::new(config, ctx),
        })
    }

    fn plan(&self) -> Result<DetectionPlan, String> {
        self.binding
            .current()
            .map(DetectionPlan::Model)
            .ok_or_else(|| NO_MODEL_REASON.to_string())
    }
}

#[async_trait]
impl Agent for MlAgent {
    fn id(&self) -> &str {
        self.runner.id()
    }

    fn config(&self) -> &AgentConfig {
        self.runner.config()
    }

    async fn start(&self) -> AgentStatus {
        let readiness = match self.binding.load().await {
            Ok(()) => Ok(()),
            Err(detail) => {
                warn!(
                    agent_id = %self.runner.id(),
                    model = %self.binding.describe(),
                    error = %detail,
                    "No valid model at start"
                );
                Err(NO_MODEL_REASON.to_string())
            }
        };
        self.runner
            .note_model(self.binding.current().as_ref().map(|m| m.version_id.as_str()));
        self.runner.start(readiness).await
    }

    async fn stop(&self) {
        self.runner.stop().await
    }

    async fn stop_and_wait(&self, timeout: Duration) -> bool {
        self.runner.stop_and_wait(timeout).await
    }

    async fn run_analysis_cycle(&self) -> CycleOutcome {
        self.runner.run_cycle(|| self.plan()).await
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
