//! Scoring artifacts: the loaded, in-memory form of a trained model
//!
//! Artifacts are ONNX graphs executed with tract. Two output conventions
//! are understood:
//! - probability output: a `[1, 2]` float tensor, column 1 is the
//!   positive (anomalous) class
//! - anomaly-score output: an integer label (`-1` = anomaly) plus a float
//!   decision score, isolation-forest style

use crate::models::FeatureVector;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tract_onnx::prelude::*;
use tracing::{debug, warn};

/// Maximum inference latency before warning
const MAX_INFERENCE_MS: u128 = 5;

type TractModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Output convention an artifact follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// `predict_proba`-style positive-class probability
    Probability,
    /// Label plus decision score, negative label flags an anomaly
    AnomalyScore,
    /// Neither; the model path is skipped
    Unsupported,
}

impl OutputKind {
    /// Infer the output kind from a metadata `modelType` string
    pub fn from_model_type(model_type: &str) -> Option<Self> {
        let t = model_type.to_ascii_lowercase();
        if t.contains("isolation") || t.contains("anomaly") || t.contains("outlier") {
            Some(OutputKind::AnomalyScore)
        } else if t.contains("classifier") || t.contains("proba") {
            Some(OutputKind::Probability)
        } else {
            None
        }
    }
}

/// One scoring result
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelOutput {
    Probability(f32),
    AnomalyScore { label: i64, score: f32 },
}

/// A loaded scoring artifact exposing a predict-equivalent capability
pub trait ScoringArtifact: Send + Sync {
    fn output_kind(&self) -> OutputKind;

    /// Score one input row
    fn predict(&self, input: &[f32]) -> Result<ModelOutput>;
}

/// Loads artifacts from disk. Injected into the lifecycle manager so the
/// on-disk format stays swappable.
pub trait ArtifactLoader: Send + Sync {
    /// Load the artifact at `path`; `model_type` and `input_width` come from
    /// bundle metadata when present
    fn load(
        &self,
        path: &Path,
        model_type: Option<&str>,
        input_width: Option<usize>,
    ) -> Result<Arc<dyn ScoringArtifact>>;
}

/// An artifact bound to the bundle it came from
pub struct LoadedModel {
    pub version_id: String,
    pub slot: String,
    /// Input column order; empty means the vector's own (sorted) order
    pub feature_names: Vec<String>,
    pub artifact: Arc<dyn ScoringArtifact>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("version_id", &self.version_id)
            .field("slot", &self.slot)
            .field("feature_names", &self.feature_names)
            .field("output_kind", &self.artifact.output_kind())
            .finish()
    }
}

impl LoadedModel {
    /// Build the model input row for a feature vector. Missing features are 0.0.
    pub fn input_for(&self, vector: &FeatureVector) -> Vec<f32> {
        if self.feature_names.is_empty() {
            vector.features.values().map(|v| *v as f32).collect()
        } else {
            self.feature_names
                .iter()
                .map(|name| vector.get(name).unwrap_or(0.0) as f32)
                .collect()
        }
    }
}

/// tract-backed ONNX artifact
pub struct OnnxArtifact {
    model: TractModel,
    kind: OutputKind,
    input_width: usize,
    inference_count: AtomicU64,
    slow_inference_count: AtomicU64,
}

impl OnnxArtifact {
    /// Parse, type and optimize an ONNX model from bytes
    pub fn from_bytes(bytes: &[u8], model_type: Option<&str>, input_width: usize) -> Result<Self> {
        let model = tract_onnx::onnx()
            .model_for_read(&mut std::io::Cursor::new(bytes))
            .context("Failed to parse ONNX model")?
            .with_input_fact(0, f32::fact([1, input_width]).into())
            .context("Failed to set input shape")?
            .into_optimized()
            .context("Failed to optimize model")?
            .into_runnable()
            .context("Failed to create runnable model")?;

        let kind = model_type
            .and_then(OutputKind::from_model_type)
            .unwrap_or_else(|| Self::inspect_outputs(&model));

        Ok(Self {
            model,
            kind,
            input_width,
            inference_count: AtomicU64::new(0),
            slow_inference_count: AtomicU64::new(0),
        })
    }

    /// Guess the output convention from the graph's output facts
    fn inspect_outputs(model: &TractModel) -> OutputKind {
        let graph = model.model();
        let outputs = graph.output_outlets().map(|o| o.len()).unwrap_or(0);

        let concrete = |ix: usize| {
            graph
                .output_fact(ix)
                .ok()
                .map(|f| (f.datum_type, f.shape.as_concrete().map(|s| s.to_vec())))
        };

        for ix in 0..outputs {
            if let Some((dt, Some(shape))) = concrete(ix) {
                if dt.is_float() && shape.last() == Some(&2) {
                    return OutputKind::Probability;
                }
            }
        }
        if outputs >= 2 {
            if let (Some((label_dt, _)), Some((score_dt, _))) = (concrete(0), concrete(1)) {
                if label_dt.is_integer() && score_dt.is_float() {
                    return OutputKind::AnomalyScore;
                }
            }
        }
        OutputKind::Unsupported
    }

    pub fn inference_count(&self) -> u64 {
        self.inference_count.load(Ordering::Relaxed)
    }

    pub fn slow_inference_count(&self) -> u64 {
        self.slow_inference_count.load(Ordering::Relaxed)
    }
}

impl ScoringArtifact for OnnxArtifact {
    fn output_kind(&self) -> OutputKind {
        self.kind
    }

    fn predict(&self, input: &[f32]) -> Result<ModelOutput> {
        if input.len() != self.input_width {
            anyhow::bail!(
                "Model expects {} features, got {}",
                self.input_width,
                input.len()
            );
        }
        let start = Instant::now();

        let tensor: Tensor =
            tract_ndarray::Array2::from_shape_vec((1, self.input_width), input.to_vec())
                .context("Failed to shape model input")?
                .into();
        let result = self.model.run(tvec!(tensor.into()))?;

        let elapsed = start.elapsed();
        self.inference_count.fetch_add(1, Ordering::Relaxed);
        if elapsed.as_millis() > MAX_INFERENCE_MS {
            self.slow_inference_count.fetch_add(1, Ordering::Relaxed);
            warn!(
                elapsed_ms = elapsed.as_millis(),
                "Inference exceeded {}ms target",
                MAX_INFERENCE_MS
            );
        } else {
            debug!(elapsed_us = elapsed.as_micros(), "Inference completed");
        }

        match self.kind {
            OutputKind::Probability => {
                let probs = result
                    .iter()
                    .find(|t| t.datum_type().is_float() && t.shape().last() == Some(&2))
                    .context("No probability output from model")?
                    .cast_to::<f32>()?;
                let view = probs.to_array_view::<f32>()?;
                let positive = view.iter().nth(1).copied().context("Empty probability output")?;
                Ok(ModelOutput::Probability(positive))
            }
            OutputKind::AnomalyScore => {
                let label = result
                    .first()
                    .context("No label output from model")?
                    .cast_to::<i64>()?;
                let label = label
                    .to_array_view::<i64>()?
                    .iter()
                    .next()
                    .copied()
                    .context("Empty label output")?;
                let score = result
                    .get(1)
                    .context("No score output from model")?
                    .cast_to::<f32>()?;
                let score = score
                    .to_array_view::<f32>()?
                    .iter()
                    .next()
                    .copied()
                    .context("Empty score output")?;
                Ok(ModelOutput::AnomalyScore { label, score })
            }
            OutputKind::Unsupported => anyhow::bail!("Artifact exposes no supported output"),
        }
    }
}

/// Default loader for ONNX bundles
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxLoader;

impl ArtifactLoader for OnnxLoader {
    fn load(
        &self,
        path: &Path,
        model_type: Option<&str>,
        input_width: Option<usize>,
    ) -> Result<Arc<dyn ScoringArtifact>> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read model file {:?}", path))?;
        let width =
            input_width.context("Bundle metadata does not declare trainingInfo.featureNames")?;
        let artifact = OnnxArtifact::from_bytes(&bytes, model_type, width)?;
        Ok(Arc::new(artifact))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct Fixed;

    impl ScoringArtifact for Fixed {
        fn output_kind(&self) -> OutputKind {
            OutputKind::Probability
        }

        fn predict(&self, _input: &[f32]) -> Result<ModelOutput> {
            Ok(ModelOutput::Probability(0.5))
        }
    }

    #[test]
    fn test_output_kind_from_model_type() {
        assert_eq!(
            OutputKind::from_model_type("IsolationForest"),
            Some(OutputKind::AnomalyScore)
        );
        assert_eq!(
            OutputKind::from_model_type("RandomForestClassifier"),
            Some(OutputKind::Probability)
        );
        assert_eq!(OutputKind::from_model_type("kmeans"), None);
    }

    #[test]
    fn test_input_uses_feature_name_order() {
        let model = LoadedModel {
            version_id: "v1".to_string(),
            slot: "default".to_string(),
            feature_names: vec!["b".to_string(), "missing".to_string(), "a".to_string()],
            artifact: Arc::new(Fixed),
        };
        let vector = FeatureVector::new("e", Utc::now(), Utc::now())
            .with_feature("a", 1.0)
            .with_feature("b", 2.0);

        assert_eq!(model.input_for(&vector), vec![2.0, 0.0, 1.0]);
    }

    #[test]
    fn test_input_defaults_to_sorted_features() {
        let model = LoadedModel {
            version_id: "v1".to_string(),
            slot: "default".to_string(),
            feature_names: vec![],
            artifact: Arc::new(Fixed),
        };
        let vector = FeatureVector::new("e", Utc::now(), Utc::now())
            .with_feature("z", 3.0)
            .with_feature("a", 1.0);

        assert_eq!(model.input_for(&vector), vec![1.0, 3.0]);
    }

    #[test]
    fn test_onnx_loader_rejects_garbage() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, b"not an onnx graph").unwrap();

        let result = OnnxLoader.load(&path, Some("classifier"), Some(3));
        assert!(result.is_err());
    }

    #[test]
    fn test_onnx_loader_missing_file() {
        let result = OnnxLoader.load(Path::new("/nonexistent/model.onnx"), None, Some(3));
        assert!(result.is_err());
    }
}
