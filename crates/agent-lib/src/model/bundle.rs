//! Model bundle layout, metadata and validation
//!
//! A bundle is one directory per model version:
//!
//! ```text
//! <bundle>/
//!   model.onnx                  required, the scoring artifact
//!   metadata.json               required, descriptor written by training
//!   deployment_manifest.json    optional
//!   README.md                   optional
//!   examples/                   optional, example / validation scripts
//! ```

use super::artifact::{ArtifactLoader, OutputKind};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const ARTIFACT_FILE: &str = "model.onnx";
pub const METADATA_FILE: &str = "metadata.json";
pub const REQUIRED_MEMBERS: &[&str] = &[ARTIFACT_FILE, METADATA_FILE];
pub const OPTIONAL_MEMBERS: &[&str] = &["deployment_manifest.json", "README.md", "examples"];

/// Default maximum artifact size (512 MiB)
pub const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 512 * 1024 * 1024;

/// Quality floors below which validation warns
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityFloors {
    pub min_f1: f64,
    pub min_roc_auc: f64,
}

impl Default for QualityFloors {
    fn default() -> Self {
        Self {
            min_f1: 0.5,
            min_roc_auc: 0.6,
        }
    }
}

/// Outcome of validating a bundle. Built once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// A report is valid iff it carries no errors
    pub fn from_parts(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Placeholder for imports that skipped validation
    pub fn not_run() -> Self {
        Self {
            is_valid: false,
            errors: Vec::new(),
            warnings: vec!["validation not run".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub version: Option<String>,
    pub model_type: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingInfo {
    pub feature_names: Option<Vec<String>>,
    pub sample_count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicMetrics {
    pub f1_score: Option<f64>,
    pub roc_auc: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationInfo {
    pub basic_metrics: Option<BasicMetrics>,
}

/// Contents of `metadata.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    #[serde(default)]
    pub model_info: Option<ModelInfo>,
    #[serde(default)]
    pub training_info: Option<TrainingInfo>,
    #[serde(default)]
    pub evaluation_info: Option<EvaluationInfo>,
}

impl BundleMetadata {
    pub fn model_type(&self) -> Option<&str> {
        self.model_info.as_ref()?.model_type.as_deref()
    }

    pub fn feature_names(&self) -> &[String] {
        self.training_info
            .as_ref()
            .and_then(|t| t.feature_names.as_deref())
            .unwrap_or(&[])
    }

    pub fn basic_metrics(&self) -> Option<&BasicMetrics> {
        self.evaluation_info.as_ref()?.basic_metrics.as_ref()
    }

    /// Flattened quality metrics for the registry entry
    pub fn metrics_snapshot(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        if let Some(m) = self.basic_metrics() {
            for (name, value) in [
                ("f1Score", m.f1_score),
                ("rocAuc", m.roc_auc),
                ("precision", m.precision),
                ("recall", m.recall),
            ] {
                if let Some(v) = value {
                    out.insert(name.to_string(), v);
                }
            }
        }
        if let Some(count) = self.training_info.as_ref().and_then(|t| t.sample_count) {
            out.insert("sampleCount".to_string(), count as f64);
        }
        out
    }
}

/// Read and parse `metadata.json` from a bundle directory
pub fn read_metadata(bundle: &Path) -> Result<BundleMetadata> {
    let path = bundle.join(METADATA_FILE);
    let raw = fs::read(&path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_slice(&raw).with_context(|| format!("Failed to parse {:?}", path))
}

/// Validate a bundle directory.
///
/// Missing required members, unparseable metadata, missing required metadata
/// fields, oversized artifacts and artifacts that fail to load are errors.
/// Missing optional members or metadata fields and weak quality metrics are
/// warnings only.
pub fn validate_bundle(
    bundle: &Path,
    loader: &dyn ArtifactLoader,
    floors: &QualityFloors,
    max_artifact_bytes: u64,
) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if !bundle.is_dir() {
        errors.push(format!("bundle path {:?} is not a directory", bundle));
        return ValidationReport::from_parts(errors, warnings);
    }

    for member in REQUIRED_MEMBERS {
        if !bundle.join(member).exists() {
            errors.push(format!("required bundle member `{}` is missing", member));
        }
    }
    for member in OPTIONAL_MEMBERS {
        if !bundle.join(member).exists() {
            warnings.push(format!("optional bundle member `{}` is missing", member));
        }
    }

    let metadata = if bundle.join(METADATA_FILE).exists() {
        match read_metadata(bundle) {
            Ok(m) => Some(m),
            Err(e) => {
                errors.push(format!("metadata is unreadable: {:#}", e));
                None
            }
        }
    } else {
        None
    };

    if let Some(ref metadata) = metadata {
        check_metadata(metadata, floors, &mut errors, &mut warnings);
    }

    let artifact = bundle.join(ARTIFACT_FILE);
    if artifact.exists() {
        match fs::metadata(&artifact) {
            Ok(meta) if meta.len() > max_artifact_bytes => errors.push(format!(
                "artifact size {} exceeds maximum {}",
                meta.len(),
                max_artifact_bytes
            )),
            Ok(_) => {
                let model_type = metadata.as_ref().and_then(|m| m.model_type());
                let width = metadata
                    .as_ref()
                    .map(|m| m.feature_names().len())
                    .filter(|n| *n > 0);
                match loader.load(&artifact, model_type, width) {
                    Ok(loaded) if loaded.output_kind() == OutputKind::Unsupported => errors.push(
                        "artifact exposes neither probability nor anomaly-score output".to_string(),
                    ),
                    Ok(_) => {}
                    Err(e) => errors.push(format!("artifact failed to load: {:#}", e)),
                }
            }
            Err(e) => errors.push(format!("artifact is unreadable: {}", e)),
        }
    }

    ValidationReport::from_parts(errors, warnings)
}

fn check_metadata(
    metadata: &BundleMetadata,
    floors: &QualityFloors,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    match metadata.model_info {
        None => errors.push("metadata field `modelInfo` is missing".to_string()),
        Some(ref info) => {
            if info.version.as_deref().map_or(true, str::is_empty) {
                errors.push("metadata field `modelInfo.version` is missing".to_string());
            }
            if info.model_type.as_deref().map_or(true, str::is_empty) {
                errors.push("metadata field `modelInfo.modelType` is missing".to_string());
            }
            if info.created_at.is_none() {
                warnings.push("metadata field `modelInfo.createdAt` is missing".to_string());
            }
        }
    }

    match metadata.training_info {
        None => warnings.push("metadata field `trainingInfo` is missing".to_string()),
        Some(ref info) => {
            if info.feature_names.as_ref().map_or(true, |n| n.is_empty()) {
                warnings.push("metadata field `trainingInfo.featureNames` is missing".to_string());
            }
            if info.sample_count.is_none() {
                warnings.push("metadata field `trainingInfo.sampleCount` is missing".to_string());
            }
        }
    }

    match metadata.basic_metrics() {
        None => {
            warnings.push("metadata field `evaluationInfo.basicMetrics` is missing".to_string())
        }
        Some(metrics) => {
            if let Some(f1) = metrics.f1_score {
                if f1 < floors.min_f1 {
                    warnings.push(format!("F1 score {:.3} is below {:.2}", f1, floors.min_f1));
                }
            }
            if let Some(auc) = metrics.roc_auc {
                if auc < floors.min_roc_auc {
                    warnings.push(format!(
                        "ROC-AUC {:.3} is below {:.2}",
                        auc, floors.min_roc_auc
                    ));
                }
            }
        }
    }
}

/// Recursively copy a bundle directory
pub(crate) fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
