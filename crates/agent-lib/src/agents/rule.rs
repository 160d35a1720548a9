use super::{Agent, AgentConfig, AgentContext, AgentRuntimeState, AgentStatus, CycleOutcome};
use super::{CycleRunner, DetectionPlan};
use async_trait::async_trait;
use std::time::{Duration, Instant};

/// Threshold rules only; never needs a model
pub struct RuleAgent {
    runner: CycleRunner,
}

impl RuleAgent {
    pub fn new(config: AgentConfig, ctx: &AgentContext) -> Self {
        Self {
            runner: CycleRunner::new(config, ctx),
        }
    }
}

#[async_trait]
impl Agent for RuleAgent {
    fn id(&self) -> &str {
        self.runner.id()
    }

    fn config(&self) -> &AgentConfig {
        self.runner.config()
    }

    async fn start(&self) -> AgentStatus {
        self.runner.start(Ok(())).await
    }

    async fn stop(&self) {
        self.runner.stop().await
    }

    async fn stop_and_wait(&self, timeout: Duration) -> bool {
        self.runner.stop_and_wait(timeout).await
    }

    async fn run_analysis_cycle(&self) -> CycleOutcome {
        self.runner.run_cycle(|| Ok(DetectionPlan::Rules)).await
    }

    fn status(&self) -> AgentRuntimeState {
        self.runner.state()
    }

    fn is_due(&self, now: Instant) -> bool {
        self.runner.is_due(now)
    }

    fn model_version(&self) -> Option<String> {
        None
    }
}
