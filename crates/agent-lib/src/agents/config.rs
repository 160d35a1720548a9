//! Agent configuration
//!
//! Agent files are YAML or JSON (camelCase keys), one agent per file. They
//! are parsed into [`AgentConfigFile`] and converted once into an immutable
//! [`AgentConfig`]; changing an agent means replacing its whole config.

use crate::anomaly::{AnomalyClassifier, RuleOverride, RuleSet, DEFAULT_PROBABILITY_THRESHOLD};
use crate::error::ConfigError;
use crate::features::{ExtractorConfig, FeatureExtractor};
use crate::model::DEFAULT_SLOT;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LOOKBACK_MINUTES: u64 = 15;
/// 30 days
pub const MAX_LOOKBACK_MINUTES: u64 = 30 * 24 * 60;
pub const DEFAULT_ANALYSIS_INTERVAL_SECS: u64 = 60;

/// On-disk agent configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfigFile {
    pub agent_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    /// `rule_based`, `ml_based` or `hybrid`
    pub agent_type: Option<String>,
    #[serde(default)]
    pub process_filters: Vec<String>,
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    /// Pin a registry version
    #[serde(default)]
    pub model_version: Option<String>,
    /// Follow whatever is deployed in this slot
    #[serde(default)]
    pub model_slot: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Hybrid only: run rules only when the model path fails
    #[serde(default)]
    pub fallback_only: Option<bool>,
    #[serde(default)]
    pub analysis_rules: AnalysisRulesFile,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRulesFile {
    pub lookback_minutes: Option<u64>,
    pub analysis_interval_seconds: Option<u64>,
    #[serde(default)]
    pub severity_mapping: BTreeMap<String, i64>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, RuleOverride>,
    #[serde(default)]
    pub target_levels: Option<Vec<String>>,
    #[serde(default)]
    pub feature_extraction: FeatureExtractionFile,
    #[serde(default)]
    pub probability_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureExtractionFile {
    #[serde(default)]
    pub disabled_shapes: Vec<String>,
}

/// Where an ML-capable agent gets its model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelRef {
    /// A bundle directory or artifact file outside the store
    Path(PathBuf),
    /// A pinned registry version
    Version(String),
    /// The deployed version of a slot, followed across deploys
    Slot(String),
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelRef::Path(p) => write!(f, "path:{}", p.display()),
            ModelRef::Version(v) => write!(f, "version:{}", v),
            ModelRef::Slot(s) => write!(f, "slot:{}", s),
        }
    }
}

/// Detection strategy selected at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Rule,
    Ml { model: ModelRef },
    Hybrid { model: ModelRef, fallback_only: bool },
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Rule => "rule",
            Strategy::Ml { .. } => "ml",
            Strategy::Hybrid { .. } => "hybrid",
        }
    }

    pub fn model(&self) -> Option<&ModelRef> {
        match self {
            Strategy::Rule => None,
            Strategy::Ml { model } | Strategy::Hybrid { model, .. } => Some(model),
        }
    }
}

/// Immutable, validated agent descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub strategy: Strategy,
    /// Empty means every source
    pub source_filters: BTreeSet<String>,
    pub capabilities: Vec<String>,
    pub analysis_interval: Duration,
    pub lookback: Duration,
    pub severity_map: BTreeMap<String, i64>,
    pub rules: RuleSet,
    pub extractor: ExtractorConfig,
    pub probability_threshold: f64,
}

impl AgentConfig {
    /// Parse YAML or JSON text
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let file: AgentConfigFile = serde_yaml::from_str(raw)?;
        Self::try_from(file)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Rule-based config with default rules, mostly for tests and tooling
    pub fn rule_based(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            description: String::new(),
            strategy: Strategy::Rule,
            source_filters: BTreeSet::new(),
            capabilities: Vec::new(),
            analysis_interval: Duration::from_secs(DEFAULT_ANALYSIS_INTERVAL_SECS),
            lookback: Duration::from_secs(DEFAULT_LOOKBACK_MINUTES * 60),
            severity_map: BTreeMap::new(),
            rules: RuleSet::default(),
            extractor: ExtractorConfig::default(),
            probability_threshold: DEFAULT_PROBABILITY_THRESHOLD,
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_filters = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.analysis_interval = interval;
        self
    }

    pub fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = lookback;
        self
    }

    pub fn classifier(&self) -> AnomalyClassifier {
        AnomalyClassifier::new(
            self.id.clone(),
            self.rules.clone(),
            self.severity_map.clone(),
            self.probability_threshold,
        )
    }

    pub fn feature_extractor(&self) -> FeatureExtractor {
        FeatureExtractor::new(self.extractor.clone())
    }
}

impl TryFrom<AgentConfigFile> for AgentConfig {
    type Error = ConfigError;

    fn try_from(file: AgentConfigFile) -> Result<Self, Self::Error> {
        let id = required(file.agent_id, "agentId")?;
        let display_name = required(file.name, "name")?;
        let description = file.description.ok_or(ConfigError::MissingField("description"))?;
        let agent_type = required(file.agent_type, "agentType")?;

        let model = model_ref(file.model_path, file.model_version, file.model_slot);
        let strategy = match agent_type.as_str() {
            "rule_based" => Strategy::Rule,
            "ml_based" => Strategy::Ml { model },
            "hybrid" => Strategy::Hybrid {
                model,
                fallback_only: file.fallback_only.unwrap_or(false),
            },
            other => {
                return Err(ConfigError::invalid(
                    "agentType",
                    format!("`{}` is not one of ml_based, rule_based, hybrid", other),
                ))
            }
        };

        let rules_file = file.analysis_rules;
        let lookback_minutes = rules_file
            .lookback_minutes
            .unwrap_or(DEFAULT_LOOKBACK_MINUTES);
        if lookback_minutes == 0 {
            return Err(ConfigError::invalid(
                "analysisRules.lookbackMinutes",
                "must be at least 1",
            ));
        }
        let lookback_secs = lookback_minutes
            .checked_mul(60)
            .filter(|_| lookback_minutes <= MAX_LOOKBACK_MINUTES)
            .ok_or_else(|| {
                ConfigError::invalid(
                    "analysisRules.lookbackMinutes",
                    format!("must be at most {}", MAX_LOOKBACK_MINUTES),
                )
            })?;
        let interval_secs = rules_file
            .analysis_interval_seconds
            .unwrap_or(DEFAULT_ANALYSIS_INTERVAL_SECS);
        if interval_secs == 0 {
            return Err(ConfigError::invalid(
                "analysisRules.analysisIntervalSeconds",
                "must be at least 1",
            ));
        }

        let probability_threshold = rules_file
            .probability_threshold
            .unwrap_or(DEFAULT_PROBABILITY_THRESHOLD);
        if !(0.0..=1.0).contains(&probability_threshold) {
            return Err(ConfigError::invalid(
                "analysisRules.probabilityThreshold",
                "must be within [0, 1]",
            ));
        }

        let rules = RuleSet::with_overrides(&rules_file.thresholds)?;

        let mut extractor = ExtractorConfig::default();
        if let Some(levels) = rules_file.target_levels {
            if levels.is_empty() {
                return Err(ConfigError::invalid(
                    "analysisRules.targetLevels",
                    "must name at least one level",
                ));
            }
            extractor.error_levels = levels.iter().map(|l| l.to_ascii_lowercase()).collect();
        }
        extractor.disabled_shapes = rules_file
            .feature_extraction
            .disabled_shapes
            .into_iter()
            .collect();

        Ok(Self {
            id,
            display_name,
            description,
            strategy,
            source_filters: file.process_filters.into_iter().collect(),
            capabilities: file.capabilities,
            analysis_interval: Duration::from_secs(interval_secs),
            lookback: Duration::from_secs(lookback_secs),
            severity_map: rules_file.severity_mapping,
            rules,
            extractor,
            probability_threshold,
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingField(field)),
    }
}

/// `modelPath` wins over `modelVersion`, which wins over `modelSlot`
fn model_ref(path: Option<PathBuf>, version: Option<String>, slot: Option<String>) -> ModelRef {
    if let Some(p) = path {
        ModelRef::Path(p)
    } else if let Some(v) = version {
        ModelRef::Version(v)
    } else {
        ModelRef::Slot(slot.unwrap_or_else(|| DEFAULT_SLOT.to_string()))
    }
}
