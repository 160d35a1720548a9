//! Agent-to-model assignment table
//!
//! Written by the agent layer when ML-capable agents start or stop,
//! read by the lifecycle manager before deleting a version.

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct ModelAssignments {
    by_agent: DashMap<String, String>,
}

impl ModelAssignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `agent_id` currently scores with `version_id`
    pub fn assign(&self, agent_id: &str, version_id: &str) {
        self.by_agent
            .insert(agent_id.to_string(), version_id.to_string());
    }

    pub fn release(&self, agent_id: &str) -> Option<String> {
        self.by_agent.remove(agent_id).map(|(_, v)| v)
    }

    pub fn version_for(&self, agent_id: &str) -> Option<String> {
        self.by_agent.get(agent_id).map(|v| v.value().clone())
    }

    /// Agents using `version_id`, sorted
    pub fn agents_for(&self, version_id: &str) -> Vec<String> {
        let mut agents: Vec<String> = self
            .by_agent
            .iter()
            .filter(|e| e.value() == version_id)
            .map(|e| e.key().clone())
            .collect();
        agents.sort();
        agents
    }
}
