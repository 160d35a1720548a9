//! Core data models shared by the extractor, classifier and agents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One raw log record pulled from the log source.
///
/// Shape-specific payload lives in `fields`; the feature extractor dispatches
/// on which keys are present there rather than on a type tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// Source identifier matched against agent source filters
    pub source: String,
    /// Device / entity the record belongs to (falls back to `source`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl LogEntry {
    /// Create a bare entry for `source` at `timestamp`
    pub fn new(source: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            source: source.into(),
            entity_id: None,
            process: None,
            level: None,
            message: None,
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_process(mut self, process: impl Into<String>) -> Self {
        self.process = Some(process.into());
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = Some(level.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Entity this entry is attributed to
    pub fn entity(&self) -> &str {
        self.entity_id.as_deref().unwrap_or(&self.source)
    }

    pub fn has_field(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Numeric field value; booleans count as 0/1, numeric strings are parsed
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.fields.get(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// String field value
    pub fn text(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }
}

/// Per-entity numeric features for one analysis window.
///
/// Features are kept in a `BTreeMap` so iteration order (and therefore
/// classification order) is stable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureVector {
    pub entity_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub features: BTreeMap<String, f64>,
}

impl FeatureVector {
    pub fn new(
        entity_id: impl Into<String>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            window_start,
            window_end,
            features: BTreeMap::new(),
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, value: f64) -> Self {
        self.features.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.features.get(name).copied()
    }

    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        self.features.insert(name.into(), value);
    }
}

/// Which detection path produced an anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Rule,
    Model,
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionMethod::Rule => write!(f, "rule"),
            DetectionMethod::Model => write!(f, "model"),
        }
    }
}

/// A detected anomaly, handed to the anomaly sink after creation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub timestamp: DateTime<Utc>,
    pub entity_id: String,
    pub anomaly_type: String,
    /// 1 (lowest) to 5 (highest)
    pub severity: u8,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub description: String,
    pub features: BTreeMap<String, f64>,
    pub source_agent_id: String,
    pub detection_method: DetectionMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

/// Severity bounds
pub const MIN_SEVERITY: u8 = 1;
pub const MAX_SEVERITY: u8 = 5;

/// Clamp an arbitrary severity value into `1..=5`
pub fn clamp_severity(value: i64) -> u8 {
    value.clamp(MIN_SEVERITY as i64, MAX_SEVERITY as i64) as u8
}
