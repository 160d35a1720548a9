//! Log batch to per-entity feature vectors

use super::shapes::{
    DnsShape, FirewallShape, GenericAccumulator, LogShape, ShapeAccumulator, WifiShape,
};
use crate::models::{FeatureVector, LogEntry};
use std::collections::{BTreeMap, BTreeSet};

/// Log levels counted as errors when no override is configured
pub const DEFAULT_ERROR_LEVELS: &[&str] = &["error", "critical", "fatal"];

/// Extractor settings taken from an agent's `analysisRules`
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorConfig {
    /// Lower-cased levels counted into `error_count`
    pub error_levels: BTreeSet<String>,
    /// Shape names to skip
    pub disabled_shapes: BTreeSet<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            error_levels: DEFAULT_ERROR_LEVELS.iter().map(|l| l.to_string()).collect(),
            disabled_shapes: BTreeSet::new(),
        }
    }
}

/// Extracts per-entity features from a raw log batch.
///
/// Pure: the same batch always yields the same vectors, in entity order.
pub struct FeatureExtractor {
    config: ExtractorConfig,
    shapes: Vec<Box<dyn LogShape>>,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(ExtractorConfig::default())
    }
}

impl FeatureExtractor {
    /// Create an extractor with the built-in WiFi, DNS and firewall shapes
    pub fn new(config: ExtractorConfig) -> Self {
        Self {
            config,
            shapes: vec![Box::new(WifiShape), Box::new(DnsShape), Box::new(FirewallShape)],
        }
    }

    /// Register an additional shape
    pub fn with_shape(mut self, shape: Box<dyn LogShape>) -> Self {
        self.shapes.push(shape);
        self
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Extract one feature vector per entity. An empty batch yields an empty map.
    pub fn extract(&self, batch: &[LogEntry]) -> BTreeMap<String, FeatureVector> {
        let mut out = BTreeMap::new();
        let (Some(window_start), Some(window_end)) = (
            batch.iter().map(|e| e.timestamp).min(),
            batch.iter().map(|e| e.timestamp).max(),
        ) else {
            return out;
        };

        let minutes = ((window_end - window_start).num_seconds() as f64 / 60.0).max(1.0);

        let active: Vec<&dyn LogShape> = self
            .shapes
            .iter()
            .map(|s| s.as_ref())
            .filter(|s| !self.config.disabled_shapes.contains(s.name()))
            .collect();

        let mut entities: BTreeMap<&str, EntityState<'_>> = BTreeMap::new();
        for entry in batch {
            let state = entities
                .entry(entry.entity())
                .or_insert_with(|| EntityState::new(&self.config.error_levels, active.len()));

            state.generic.observe(entry);
            for (idx, shape) in active.iter().enumerate() {
                if shape.matches(entry) {
                    state.shapes[idx]
                        .get_or_insert_with(|| shape.accumulator())
                        .observe(entry);
                }
            }
        }

        for (entity, state) in entities {
            let mut vector = FeatureVector::new(entity, window_start, window_end);
            state.generic.finish(&mut vector);
            for acc in state.shapes.iter().flatten() {
                acc.finish(minutes, &mut vector);
            }
            out.insert(entity.to_string(), vector);
        }

        out
    }
}

struct EntityState<'a> {
    generic: GenericAccumulator<'a>,
    shapes: Vec<Option<Box<dyn ShapeAccumulator>>>,
}

impl<'a> EntityState<'a> {
    fn new(error_levels: &'a BTreeSet<String>, shape_count: usize) -> Self {
        Self {
            generic: GenericAccumulator::new(error_levels),
            shapes: (0..shape_count).map(|_| None).collect(),
        }
    }
}
