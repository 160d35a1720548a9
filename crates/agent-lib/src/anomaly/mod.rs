//! Anomaly detection over feature vectors
//!
//! This module provides:
//! - The threshold rule table and per-agent overrides
//! - The classifier fusing rule hits with model scores

mod classifier;
mod rules;

pub use classifier::{AnomalyClassifier, DEFAULT_PROBABILITY_THRESHOLD};
pub use rules::{default_rules, types, RuleHit, RuleOverride, RuleParams, RuleSet, ThresholdRule};
