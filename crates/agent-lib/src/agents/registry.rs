//! Agent registry and the single driver loop
//!
//! One ticker drives every registered agent. Each due agent gets its cycle
//! on its own task; an agent whose previous cycle is still running skips
//! the tick instead of queueing.

use super::{
    build_agent, Agent, AgentConfig, AgentContext, AgentRuntimeState, AgentStatus, CycleOutcome,
};
use crate::error::ConfigError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// How often the driver checks which agents are due
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

/// How long stop/restart waits for an in-flight cycle
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Listing row for one agent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub strategy: String,
    pub model_version: Option<String>,
    pub state: AgentRuntimeState,
}

pub struct AgentRegistry {
    agents: DashMap<String, Arc<dyn Agent>>,
    ctx: AgentContext,
    shutdown_timeout: Duration,
}

impl AgentRegistry {
    pub fn new(ctx: AgentContext) -> Self {
        Self {
            agents: DashMap::new(),
            ctx,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    /// Build an agent from its config and register it. The agent is not
    /// started.
    pub fn create_agent(&self, config: AgentConfig) -> Result<Arc<dyn Agent>, ConfigError> {
        let agent = build_agent(config, &self.ctx)?;
        self.register_agent(agent.clone())?;
        Ok(agent)
    }

    pub fn register_agent(&self, agent: Arc<dyn Agent>) -> Result<(), ConfigError> {
        match self.agents.entry(agent.id().to_string()) {
            Entry::Occupied(e) => Err(ConfigError::DuplicateAgent(e.key().clone())),
            Entry::Vacant(e) => {
                info!(
                    agent_id = %agent.id(),
                    strategy = agent.config().strategy.name(),
                    "Agent registered"
                );
                e.insert(agent);
                Ok(())
            }
        }
    }

    /// Stop the agent, wait for its in-flight cycle, then drop it
    pub async fn unregister_agent(&self, id: &str) -> Result<Arc<dyn Agent>, ConfigError> {
        let (_, agent) = self
            .agents
            .remove(id)
            .ok_or_else(|| ConfigError::UnknownAgent(id.to_string()))?;
        agent.stop_and_wait(self.shutdown_timeout).await;
        info!(agent_id = %id, "Agent unregistered");
        self.refresh_active_gauge();
        Ok(agent)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(id).map(|a| a.value().clone())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub async fn start_agent(&self, id: &str) -> Result<AgentStatus, ConfigError> {
        let agent = self.require(id)?;
        let status = agent.start().await;
        self.refresh_active_gauge();
        Ok(status)
    }

    pub async fn stop_agent(&self, id: &str) -> Result<(), ConfigError> {
        let agent = self.require(id)?;
        agent.stop_and_wait(self.shutdown_timeout).await;
        self.refresh_active_gauge();
        Ok(())
    }

    pub async fn restart_agent(&self, id: &str) -> Result<AgentStatus, ConfigError> {
        let agent = self.require(id)?;
        agent.stop_and_wait(self.shutdown_timeout).await;
        let status = agent.start().await;
        info!(agent_id = %id, status = %status, "Agent restarted");
        self.refresh_active_gauge();
        Ok(status)
    }

    /// Swap an agent's whole config. The new agent is built first, so an
    /// invalid config leaves the running agent untouched.
    pub async fn replace_config(&self, config: AgentConfig) -> Result<AgentStatus, ConfigError> {
        let id = config.id.clone();
        let old = self.require(&id)?;
        let replacement = build_agent(config, &self.ctx)?;
        old.stop_and_wait(self.shutdown_timeout).await;
        self.agents.insert(id.clone(), replacement.clone());
        let status = replacement.start().await;
        info!(agent_id = %id, status = %status, "Agent config replaced");
        self.refresh_active_gauge();
        Ok(status)
    }

    /// Start every registered agent; returns how many came up `active`
    pub async fn start_all(&self) -> usize {
        let mut active = 0;
        for agent in self.snapshot() {
            if agent.start().await == AgentStatus::Active {
                active += 1;
            }
        }
        self.refresh_active_gauge();
        active
    }

    /// Rows sorted by agent id
    pub fn list_agents(&self) -> Vec<AgentSummary> {
        let mut rows: Vec<AgentSummary> = self
            .snapshot()
            .into_iter()
            .map(|agent| AgentSummary {
                id: agent.id().to_string(),
                name: agent.config().display_name.clone(),
                strategy: agent.config().strategy.name().to_string(),
                model_version: agent.model_version(),
                state: agent.status(),
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    /// Spawn a cycle for every due agent
    pub fn tick(&self) -> Vec<JoinHandle<CycleOutcome>> {
        let now = Instant::now();
        let handles: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|agent| agent.is_due(now))
            .map(|agent| {
                tokio::spawn(async move {
                    let outcome = agent.run_analysis_cycle().await;
                    debug!(agent_id = %agent.id(), outcome = ?outcome, "Cycle finished");
                    outcome
                })
            })
            .collect();
        self.refresh_active_gauge();
        handles
    }

    /// Drive all agents until `shutdown` fires, then stop them and wait
    /// for in-flight cycles
    pub async fn run(
        self: Arc<Self>,
        tick_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            tick_ms = tick_interval.as_millis() as u64,
            agents = self.len(),
            "Starting agent driver"
        );

        let mut ticker = interval(tick_interval);
        let mut in_flight: Vec<JoinHandle<CycleOutcome>> = Vec::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    in_flight.retain(|h| !h.is_finished());
                    in_flight.extend(self.tick());
                }
                _ = shutdown.recv() => {
                    info!(in_flight = in_flight.len(), "Shutting down agent driver");
                    break;
                }
            }
        }

        self.shutdown().await;
        let drain = async {
            for handle in in_flight {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Cycle task ended abnormally");
                }
            }
        };
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            warn!("In-flight cycles did not drain before shutdown timeout");
        }
    }

    /// Stop every agent and wait for their cycles
    pub async fn shutdown(&self) {
        let agents = self.snapshot();
        for agent in &agents {
            agent.stop().await;
        }
        // One deadline for all agents
        let deadline = Instant::now() + self.shutdown_timeout;
        let mut stuck = 0;
        for agent in &agents {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !agent.stop_and_wait(remaining).await {
                stuck += 1;
            }
        }
        if stuck > 0 {
            warn!(stuck, "Agents still analyzing at shutdown");
        }
        self.refresh_active_gauge();
    }

    fn require(&self, id: &str) -> Result<Arc<dyn Agent>, ConfigError> {
        self.get(id)
            .ok_or_else(|| ConfigError::UnknownAgent(id.to_string()))
    }

    fn snapshot(&self) -> Vec<Arc<dyn Agent>> {
        self.agents.iter().map(|e| e.value().clone()).collect()
    }

    fn refresh_active_gauge(&self) {
        let active = self
            .agents
            .iter()
            .filter(|e| {
                matches!(
                    e.value().status().status,
                    AgentStatus::Active | AgentStatus::Analyzing
                )
            })
            .count();
        self.ctx.metrics.set_agents_active(active as i64);
    }
}
