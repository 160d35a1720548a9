//! Threshold rules for the rule detection path
//!
//! Each rule watches one feature. It fires when the value is strictly above
//! its threshold; severity is `floor(value / divisor)` clamped to 1..=5.

use crate::error::ConfigError;
use crate::features::names;
use crate::models::{clamp_severity, FeatureVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Anomaly type identifiers
pub mod types {
    pub const AUTH_FAILURE: &str = "auth_failure";
    pub const DEAUTH_FLOOD: &str = "deauth_flood";
    pub const BEACON_FLOOD: &str = "beacon_flood";
    pub const MAC_SPOOFING: &str = "mac_spoofing";
    pub const DNS_NXDOMAIN_FLOOD: &str = "dns_nxdomain_flood";
    pub const DNS_TUNNELING: &str = "dns_tunneling";
    pub const PORT_SCAN: &str = "port_scan";
    pub const FIREWALL_BLOCK_FLOOD: &str = "firewall_block_flood";
    pub const ERROR_BURST: &str = "error_burst";
    pub const PROCESS_CHURN: &str = "process_churn";
    /// Model hit that no rule feature explains
    pub const ML_ANOMALY: &str = "ml_anomaly";
}

/// One threshold rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdRule {
    pub anomaly_type: String,
    pub feature: String,
    pub threshold: f64,
    pub divisor: f64,
    pub confidence: f64,
    pub enabled: bool,
    /// Human-readable label used in anomaly descriptions
    pub label: String,
}

/// A rule that fired
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleHit {
    pub value: f64,
    pub severity: u8,
}

impl ThresholdRule {
    pub fn new(
        anomaly_type: &str,
        feature: &str,
        threshold: f64,
        divisor: f64,
        confidence: f64,
        label: &str,
    ) -> Self {
        Self {
            anomaly_type: anomaly_type.to_string(),
            feature: feature.to_string(),
            threshold,
            divisor,
            confidence,
            enabled: true,
            label: label.to_string(),
        }
    }

    /// Feature value, also accepting the camelCase spelling of the name
    pub fn value(&self, vector: &FeatureVector) -> Option<f64> {
        vector
            .get(&self.feature)
            .or_else(|| vector.get(&camel_case(&self.feature)))
    }

    pub fn severity(&self, value: f64) -> u8 {
        clamp_severity((value / self.divisor).floor() as i64)
    }

    pub fn evaluate(&self, vector: &FeatureVector) -> Option<RuleHit> {
        if !self.enabled {
            return None;
        }
        let value = self.value(vector)?;
        if value > self.threshold {
            Some(RuleHit {
                value,
                severity: self.severity(value),
            })
        } else {
            None
        }
    }

    /// How far the feature sits relative to the threshold; `None` when the
    /// feature is absent, zero or the rule is disabled
    pub fn ratio(&self, vector: &FeatureVector) -> Option<f64> {
        if !self.enabled {
            return None;
        }
        let value = self.value(vector).filter(|v| *v > 0.0)?;
        if self.threshold > 0.0 {
            Some(value / self.threshold)
        } else {
            Some(value)
        }
    }

    pub fn describe(&self, value: f64) -> String {
        format!(
            "{}: {} = {} exceeds threshold {}",
            self.label, self.feature, value, self.threshold
        )
    }
}

fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// The built-in rule table
pub fn default_rules() -> Vec<ThresholdRule> {
    vec![
        ThresholdRule::new(
            types::AUTH_FAILURE,
            names::AUTH_FAILURES,
            5.0,
            2.0,
            0.9,
            "Authentication failure flood",
        ),
        ThresholdRule::new(
            types::DEAUTH_FLOOD,
            names::DEAUTH_FRAMES,
            10.0,
            5.0,
            0.8,
            "Deauthentication flood",
        ),
        ThresholdRule::new(
            types::BEACON_FLOOD,
            names::BEACON_FRAMES,
            100.0,
            50.0,
            0.6,
            "Beacon flood",
        ),
        ThresholdRule::new(
            types::MAC_SPOOFING,
            names::DISTINCT_CLIENT_MACS,
            3.0,
            1.0,
            0.7,
            "Possible MAC spoofing",
        ),
        ThresholdRule::new(
            types::DNS_NXDOMAIN_FLOOD,
            names::NXDOMAIN_RESPONSES,
            20.0,
            10.0,
            0.8,
            "NXDOMAIN flood",
        ),
        ThresholdRule::new(
            types::DNS_TUNNELING,
            names::DISTINCT_DOMAINS,
            50.0,
            25.0,
            0.65,
            "Possible DNS tunneling",
        ),
        ThresholdRule::new(
            types::PORT_SCAN,
            names::DISTINCT_DST_PORTS,
            20.0,
            10.0,
            0.85,
            "Port scan",
        ),
        ThresholdRule::new(
            types::FIREWALL_BLOCK_FLOOD,
            names::BLOCKED_CONNECTIONS,
            50.0,
            25.0,
            0.75,
            "Blocked connection flood",
        ),
        ThresholdRule::new(
            types::ERROR_BURST,
            names::ERROR_COUNT,
            10.0,
            5.0,
            0.7,
            "Error burst",
        ),
        ThresholdRule::new(
            types::PROCESS_CHURN,
            names::DISTINCT_PROCESSES,
            25.0,
            10.0,
            0.6,
            "Process churn",
        ),
    ]
}

/// Per-agent override from `analysisRules.thresholds`: a bare number
/// replaces the threshold only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleOverride {
    Threshold(f64),
    Params(RuleParams),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuleParams {
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub divisor: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Ordered rule table; evaluation order is table order
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    rules: Vec<ThresholdRule>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

impl RuleSet {
    pub fn new(rules: Vec<ThresholdRule>) -> Self {
        Self { rules }
    }

    /// Default table with per-agent overrides applied
    pub fn with_overrides(overrides: &BTreeMap<String, RuleOverride>) -> Result<Self, ConfigError> {
        let mut set = Self::default();
        set.apply_overrides(overrides)?;
        Ok(set)
    }

    pub fn apply_overrides(
        &mut self,
        overrides: &BTreeMap<String, RuleOverride>,
    ) -> Result<(), ConfigError> {
        for (anomaly_type, change) in overrides {
            let rule = self
                .rules
                .iter_mut()
                .find(|r| &r.anomaly_type == anomaly_type)
                .ok_or_else(|| {
                    ConfigError::invalid(
                        "analysisRules.thresholds",
                        format!("unknown anomaly type `{}`", anomaly_type),
                    )
                })?;

            let params = match change {
                RuleOverride::Threshold(t) => RuleParams {
                    threshold: Some(*t),
                    ..Default::default()
                },
                RuleOverride::Params(p) => p.clone(),
            };

            if let Some(t) = params.threshold {
                if !t.is_finite() || t < 0.0 {
                    return Err(ConfigError::invalid(
                        "analysisRules.thresholds",
                        format!("threshold for `{}` must be a non-negative number", anomaly_type),
                    ));
                }
                rule.threshold = t;
            }
            if let Some(d) = params.divisor {
                if !d.is_finite() || d <= 0.0 {
                    return Err(ConfigError::invalid(
                        "analysisRules.thresholds",
                        format!("divisor for `{}` must be positive", anomaly_type),
                    ));
                }
                rule.divisor = d;
            }
            if let Some(c) = params.confidence {
                if !(0.0..=1.0).contains(&c) {
                    return Err(ConfigError::invalid(
                        "analysisRules.thresholds",
                        format!("confidence for `{}` must be within [0, 1]", anomaly_type),
                    ));
                }
                rule.confidence = c;
            }
            if let Some(e) = params.enabled {
                rule.enabled = e;
            }
        }
        Ok(())
    }

    pub fn get(&self, anomaly_type: &str) -> Option<&ThresholdRule> {
        self.rules.iter().find(|r| r.anomaly_type == anomaly_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThresholdRule> {
        self.rules.iter()
    }

    /// Enabled rule whose feature sits furthest above (or closest to) its
    /// threshold. Earlier rules win ties.
    pub fn closest(&self, vector: &FeatureVector) -> Option<(&ThresholdRule, f64)> {
        let mut best: Option<(&ThresholdRule, f64, f64)> = None;
        for rule in &self.rules {
            let Some(ratio) = rule.ratio(vector) else {
                continue;
            };
            if best.map_or(true, |(_, r, _)| ratio > r) {
                let value = rule.value(vector).unwrap_or_default();
                best = Some((rule, ratio, value));
            }
        }
        best.map(|(rule, _, value)| (rule, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn vector(pairs: &[(&str, f64)]) -> FeatureVector {
        pairs
            .iter()
            .fold(FeatureVector::new("e", Utc::now(), Utc::now()), |v, (k, x)| {
                v.with_feature(*k, *x)
            })
    }

    #[test]
    fn test_rule_fires_strictly_above_threshold() {
        let rules = RuleSet::default();
        let rule = rules.get(types::AUTH_FAILURE).unwrap();

        assert!(rule.evaluate(&vector(&[("auth_failures", 5.0)])).is_none());
        let hit = rule.evaluate(&vector(&[("auth_failures", 6.0)])).unwrap();
        assert_eq!(hit.severity, 3);
    }

    #[test]
    fn test_severity_is_clamped() {
        let rules = RuleSet::default();
        let mac = rules.get(types::MAC_SPOOFING).unwrap();
        assert_eq!(mac.severity(4.0), 4);
        assert_eq!(mac.severity(40.0), 5);

        let beacon = rules.get(types::BEACON_FLOOD).unwrap();
        // 101 / 50 floors to 2
        assert_eq!(beacon.severity(101.0), 2);
        assert_eq!(beacon.severity(10.0), 1);
    }

    #[test]
    fn test_camel_case_feature_alias() {
        let rules = RuleSet::default();
        let rule = rules.get(types::AUTH_FAILURE).unwrap();
        assert_eq!(rule.value(&vector(&[("authFailures", 12.0)])), Some(12.0));
        assert_eq!(camel_case("distinct_dst_ports"), "distinctDstPorts");
    }

    #[test]
    fn test_overrides() {
        let raw = r#"
            auth_failure: 8
            port_scan: { threshold: 5, divisor: 2, confidence: 0.5 }
            process_churn: { enabled: false }
        "#;
        let overrides: BTreeMap<String, RuleOverride> = serde_yaml::from_str(raw).unwrap();
        let rules = RuleSet::with_overrides(&overrides).unwrap();

        let auth = rules.get(types::AUTH_FAILURE).unwrap();
        assert_eq!(auth.threshold, 8.0);
        assert_eq!(auth.divisor, 2.0);

        let scan = rules.get(types::PORT_SCAN).unwrap();
        assert_eq!((scan.threshold, scan.divisor, scan.confidence), (5.0, 2.0, 0.5));

        let churn = rules.get(types::PROCESS_CHURN).unwrap();
        assert!(!churn.enabled);
        assert!(churn.evaluate(&vector(&[("distinct_processes", 100.0)])).is_none());
    }

    #[test]
    fn test_invalid_overrides_rejected() {
        let mut bad = BTreeMap::new();
        bad.insert("nonsense".to_string(), RuleOverride::Threshold(1.0));
        assert!(RuleSet::with_overrides(&bad).is_err());

        let mut bad = BTreeMap::new();
        bad.insert(
            types::PORT_SCAN.to_string(),
            RuleOverride::Params(RuleParams {
                divisor: Some(0.0),
                ..Default::default()
            }),
        );
        assert!(RuleSet::with_overrides(&bad).is_err());

        let mut bad = BTreeMap::new();
        bad.insert(
            types::PORT_SCAN.to_string(),
            RuleOverride::Params(RuleParams {
                confidence: Some(1.5),
                ..Default::default()
            }),
        );
        assert!(RuleSet::with_overrides(&bad).is_err());
    }

    #[test]
    fn test_closest_rule_by_ratio() {
        let rules = RuleSet::default();
        // auth 3/5 = 0.6, ports 18/20 = 0.9
        let v = vector(&[("auth_failures", 3.0), ("distinct_dst_ports", 18.0)]);
        let (rule, value) = rules.closest(&v).unwrap();
        assert_eq!(rule.anomaly_type, types::PORT_SCAN);
        assert_eq!(value, 18.0);

        assert!(rules.closest(&vector(&[("entry_count", 4.0)])).is_none());
        assert!(rules.closest(&vector(&[("auth_failures", 0.0)])).is_none());
    }
}
