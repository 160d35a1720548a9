//! Error types for agents and the model lifecycle

use crate::model::ValidationReport;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid or missing agent configuration. Fatal at agent construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse agent config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("failed to read agent config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("agent `{0}` is already registered")]
    DuplicateAgent(String),

    #[error("agent `{0}` is not registered")]
    UnknownAgent(String),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Operator action rejected because it would break a registry invariant.
/// The registry is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryConflict {
    #[error("model version `{0}` already exists")]
    DuplicateVersion(String),

    #[error("model version `{0}` is deployed; roll back before deleting")]
    DeleteWhileDeployed(String),

    #[error("model version `{version}` is assigned to agents: {}", agents.join(", "))]
    DeleteWhileAssigned { version: String, agents: Vec<String> },
}

/// Errors from [`ModelLifecycleManager`](crate::model::ModelLifecycleManager) operations
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("bundle validation failed: {}", .0.errors.join("; "))]
    Validation(ValidationReport),

    #[error(transparent)]
    Conflict(#[from] RegistryConflict),

    #[error("model version `{0}` not found")]
    NotFound(String),

    #[error("invalid model version id `{0}`")]
    InvalidVersionId(String),

    #[error("failed to load model `{version}`: {source:#}")]
    Load {
        version: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ModelError::Conflict(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ModelError::Validation(_))
    }
}

/// Failure inside a single analysis cycle. Caught per agent and reported
/// through the agent's status; never propagated to the driver loop.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("log fetch failed: {0:#}")]
    Fetch(anyhow::Error),

    #[error("anomaly persistence failed: {0:#}")]
    Persist(anyhow::Error),

    #[error("detection failed: {0:#}")]
    Detection(anyhow::Error),
}

/// Pipeline stage a cycle failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStage {
    Fetch,
    Detect,
    Persist,
}

impl CycleError {
    pub fn stage(&self) -> CycleStage {
        match self {
            CycleError::Fetch(_) => CycleStage::Fetch,
            CycleError::Persist(_) => CycleStage::Persist,
            CycleError::Detection(_) => CycleStage::Detect,
        }
    }
}
