//! Shared fixtures for unit tests: a text-driven artifact loader and
//! bundle builders

use crate::model::{
    ArtifactLoader, ModelOutput, OutputKind, ScoringArtifact, ARTIFACT_FILE, METADATA_FILE,
};
use anyhow::Result;
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Artifact returning a fixed output
pub struct FixedArtifact {
    pub kind: OutputKind,
    pub output: Option<ModelOutput>,
}

impl ScoringArtifact for FixedArtifact {
    fn output_kind(&self) -> OutputKind {
        self.kind
    }

    fn predict(&self, _input: &[f32]) -> Result<ModelOutput> {
        self.output
            .ok_or_else(|| anyhow::anyhow!("stub artifact refuses to predict"))
    }
}

pub fn probability_artifact(p: f32) -> Arc<dyn ScoringArtifact> {
    Arc::new(FixedArtifact {
        kind: OutputKind::Probability,
        output: Some(ModelOutput::Probability(p)),
    })
}

pub fn score_artifact(label: i64, score: f32) -> Arc<dyn ScoringArtifact> {
    Arc::new(FixedArtifact {
        kind: OutputKind::AnomalyScore,
        output: Some(ModelOutput::AnomalyScore { label, score }),
    })
}

pub fn failing_artifact() -> Arc<dyn ScoringArtifact> {
    Arc::new(FixedArtifact {
        kind: OutputKind::Probability,
        output: None,
    })
}

pub fn unsupported_artifact() -> Arc<dyn ScoringArtifact> {
    Arc::new(FixedArtifact {
        kind: OutputKind::Unsupported,
        output: None,
    })
}

/// Interprets the artifact file's text:
/// `proba:<p>`, `score:<label>:<score>`, `fail`, `unsupported`; anything
/// else fails to load
pub struct TextLoader;

impl ArtifactLoader for TextLoader {
    fn load(
        &self,
        path: &Path,
        _model_type: Option<&str>,
        _input_width: Option<usize>,
    ) -> Result<Arc<dyn ScoringArtifact>> {
        let text = fs::read_to_string(path)?;
        let parts: Vec<&str> = text.trim().split(':').collect();
        match parts.as_slice() {
            ["proba", p] => Ok(probability_artifact(p.parse()?)),
            ["score", label, score] => Ok(score_artifact(label.parse()?, score.parse()?)),
            ["fail"] => Ok(failing_artifact()),
            ["unsupported"] => Ok(unsupported_artifact()),
            _ => anyhow::bail!("cannot load `{}`", text.trim()),
        }
    }
}

pub fn metadata(features: &[&str]) -> serde_json::Value {
    json!({
        "modelInfo": { "version": "1.0.0", "modelType": "classifier", "createdAt": "2024-01-01T00:00:00Z" },
        "trainingInfo": { "featureNames": features, "sampleCount": 1000 },
        "evaluationInfo": { "basicMetrics": { "f1Score": 0.9, "rocAuc": 0.95, "precision": 0.9, "recall": 0.88 } }
    })
}

/// Write a bundle directory with the given artifact text and metadata
pub fn write_bundle(dir: &Path, artifact: Option<&str>, metadata: Option<serde_json::Value>) {
    fs::create_dir_all(dir).unwrap();
    if let Some(a) = artifact {
        fs::write(dir.join(ARTIFACT_FILE), a).unwrap();
    }
    if let Some(m) = metadata {
        fs::write(dir.join(METADATA_FILE), serde_json::to_vec_pretty(&m).unwrap()).unwrap();
    }
}

/// A complete, valid bundle scoring every input with probability `p`
pub fn valid_bundle(dir: &Path, p: f32) {
    write_bundle(
        dir,
        Some(&format!("proba:{}", p)),
        Some(metadata(&["auth_failures", "error_count"])),
    );
}
