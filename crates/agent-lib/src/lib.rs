//! Core library for device-log anomaly detection
//!
//! This crate provides the core functionality for:
//! - Per-entity feature extraction over log windows
//! - Rule and model based anomaly classification
//! - Model bundle lifecycle (import, validate, deploy, rollback, delete)
//! - Detection agents driven by a single registry loop
//! - Health checks and observability

pub mod agents;
pub mod anomaly;
pub mod error;
pub mod features;
pub mod health;
pub mod io;
pub mod model;
pub mod models;
pub mod observability;

#[cfg(test)]
pub(crate) mod test_support;

pub use agents::{
    build_agent, Agent, AgentConfig, AgentContext, AgentRegistry, AgentRuntimeState, AgentStatus,
    CycleOutcome,
};
pub use anomaly::{AnomalyClassifier, RuleSet, ThresholdRule};
pub use error::{ConfigError, CycleError, ModelError, RegistryConflict};
pub use features::{ExtractorConfig, FeatureExtractor};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use model::{ImportOptions, ModelLifecycleManager, ModelStatus, ModelStoreConfig, ModelVersion};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
