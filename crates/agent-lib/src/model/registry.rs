//! On-disk model version registry
//!
//! The registry is a single JSON mapping `versionId -> ModelVersion`.
//! Writes go to a temp file that is synced and renamed over the original,
//! so lock-free readers always see a complete mapping.

use super::bundle::ValidationReport;
use crate::error::ModelError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Lifecycle status of a model version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Imported,
    Available,
    Deployed,
    RolledBack,
    Deleted,
}

impl ModelStatus {
    /// Statuses from which a version may be deployed or rolled back to
    pub fn is_deployable(&self) -> bool {
        matches!(
            self,
            ModelStatus::Imported | ModelStatus::Available | ModelStatus::RolledBack
        )
    }
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelStatus::Imported => "imported",
            ModelStatus::Available => "available",
            ModelStatus::Deployed => "deployed",
            ModelStatus::RolledBack => "rolled_back",
            ModelStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// One recorded status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTransition {
    pub from: ModelStatus,
    pub to: ModelStatus,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Registry entry for one imported bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelVersion {
    pub version_id: String,
    /// Deployment target; at most one version per slot is `deployed`
    pub slot: String,
    pub bundle_path: PathBuf,
    pub artifact_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub status: ModelStatus,
    pub validation: ValidationReport,
    #[serde(default)]
    pub metrics_snapshot: BTreeMap<String, f64>,
    pub checksum: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<StatusTransition>,
}

impl ModelVersion {
    /// Move to `to`, recording the change
    pub(crate) fn transition(&mut self, to: ModelStatus, reason: impl Into<String>) {
        let now = Utc::now();
        self.history.push(StatusTransition {
            from: self.status,
            to,
            at: now,
            reason: reason.into(),
        });
        if to == ModelStatus::Deployed {
            self.deployed_at = Some(now);
        }
        self.status = to;
    }
}

pub type RegistryMap = BTreeMap<String, ModelVersion>;

/// File-backed registry mapping
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole mapping; a missing file is an empty registry
    pub fn load(&self) -> Result<RegistryMap, ModelError> {
        match fs::read(&self.path) {
            Ok(raw) if raw.is_empty() => Ok(RegistryMap::new()),
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the whole mapping
    pub fn save(&self, registry: &RegistryMap) -> Result<(), ModelError> {
        let bytes = serde_json::to_vec_pretty(registry)?;

        // Write to temp file first
        let temp_path = self.path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}
