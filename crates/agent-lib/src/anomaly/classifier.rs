//! Anomaly classification: rule thresholds plus model score fusion
//!
//! The rule path and the model path run independently and their results
//! are concatenated, rule hits first. Nothing is deduplicated; a rule hit
//! and a model hit on the same entity are reported as two anomalies.

use super::rules::{types, RuleSet, ThresholdRule};
use crate::model::{LoadedModel, ModelOutput, OutputKind};
use crate::models::{clamp_severity, Anomaly, DetectionMethod, FeatureVector};
use anyhow::Result;
use std::collections::BTreeMap;
use tracing::warn;

/// Positive-class probability above which a probability model flags an anomaly
pub const DEFAULT_PROBABILITY_THRESHOLD: f64 = 0.95;

/// Turns feature vectors into anomaly records
#[derive(Debug, Clone)]
pub struct AnomalyClassifier {
    agent_id: String,
    rules: RuleSet,
    severity_map: BTreeMap<String, i64>,
    probability_threshold: f64,
}

impl AnomalyClassifier {
    pub fn new(
        agent_id: impl Into<String>,
        rules: RuleSet,
        severity_map: BTreeMap<String, i64>,
        probability_threshold: f64,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            rules,
            severity_map,
            probability_threshold,
        }
    }

    /// Default rules, no severity mapping, default probability threshold
    pub fn with_defaults(agent_id: impl Into<String>) -> Self {
        Self::new(
            agent_id,
            RuleSet::default(),
            BTreeMap::new(),
            DEFAULT_PROBABILITY_THRESHOLD,
        )
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn probability_threshold(&self) -> f64 {
        self.probability_threshold
    }

    /// Run both paths. A model that fails or exposes no supported output is
    /// logged and skipped; the rule results still stand.
    pub fn classify(&self, vector: &FeatureVector, model: Option<&LoadedModel>) -> Vec<Anomaly> {
        let mut anomalies = self.classify_rules(vector);
        if let Some(model) = model {
            match self.classify_model(vector, model) {
                Ok(Some(hits)) => anomalies.extend(hits),
                Ok(None) => {}
                Err(e) => warn!(
                    agent_id = %self.agent_id,
                    entity_id = %vector.entity_id,
                    version = %model.version_id,
                    error = %e,
                    "Model scoring failed, keeping rule results"
                ),
            }
        }
        anomalies
    }

    /// Rule path only, in rule-table order
    pub fn classify_rules(&self, vector: &FeatureVector) -> Vec<Anomaly> {
        self.rules
            .iter()
            .filter_map(|rule| {
                let hit = rule.evaluate(vector)?;
                Some(Anomaly {
                    timestamp: vector.window_end,
                    entity_id: vector.entity_id.clone(),
                    anomaly_type: rule.anomaly_type.clone(),
                    severity: self.mapped_severity(&rule.anomaly_type, hit.severity),
                    confidence: rule.confidence,
                    description: rule.describe(hit.value),
                    features: vector.features.clone(),
                    source_agent_id: self.agent_id.clone(),
                    detection_method: DetectionMethod::Rule,
                    model_version: None,
                })
            })
            .collect()
    }

    /// Model path only.
    ///
    /// `Ok(None)` means the artifact exposes no supported output and the
    /// path was skipped; `Ok(Some(vec![]))` means the model scored the
    /// vector as normal.
    pub fn classify_model(
        &self,
        vector: &FeatureVector,
        model: &LoadedModel,
    ) -> Result<Option<Vec<Anomaly>>> {
        if model.artifact.output_kind() == OutputKind::Unsupported {
            warn!(
                agent_id = %self.agent_id,
                version = %model.version_id,
                "Model exposes neither probability nor anomaly-score output, skipping model path"
            );
            return Ok(None);
        }

        let input = model.input_for(vector);
        let confidence = match model.artifact.predict(&input)? {
            ModelOutput::Probability(p) => {
                let p = p as f64;
                (p > self.probability_threshold).then_some(p)
            }
            ModelOutput::AnomalyScore { label, score } => {
                (label < 0).then(|| (1.0 - (score as f64).exp()).clamp(0.0, 1.0))
            }
        };

        Ok(Some(
            confidence
                .map(|c| vec![self.model_anomaly(vector, model, c)])
                .unwrap_or_default(),
        ))
    }

    /// Label a model hit with the rule that sits closest to firing
    fn model_anomaly(
        &self,
        vector: &FeatureVector,
        model: &LoadedModel,
        confidence: f64,
    ) -> Anomaly {
        let (anomaly_type, severity, explanation) = match self.rules.closest(vector) {
            Some((rule, value)) => (
                rule.anomaly_type.clone(),
                self.mapped_severity(&rule.anomaly_type, rule.severity(value)),
                explain(rule, value),
            ),
            None => (
                types::ML_ANOMALY.to_string(),
                self.mapped_severity(
                    types::ML_ANOMALY,
                    clamp_severity((confidence * 5.0).ceil() as i64),
                ),
                "no rule feature present".to_string(),
            ),
        };

        Anomaly {
            timestamp: vector.window_end,
            entity_id: vector.entity_id.clone(),
            anomaly_type,
            severity,
            confidence,
            description: format!(
                "Model {} flagged {} with confidence {:.3} ({})",
                model.version_id, vector.entity_id, confidence, explanation
            ),
            features: vector.features.clone(),
            source_agent_id: self.agent_id.clone(),
            detection_method: DetectionMethod::Model,
            model_version: Some(model.version_id.clone()),
        }
    }

    fn mapped_severity(&self, anomaly_type: &str, computed: u8) -> u8 {
        self.severity_map
            .get(anomaly_type)
            .map(|s| clamp_severity(*s))
            .unwrap_or(computed)
    }
}

fn explain(rule: &ThresholdRule, value: f64) -> String {
    format!(
        "closest rule {}: {} = {} vs threshold {}",
        rule.anomaly_type, rule.feature, value, rule.threshold
    )
}
