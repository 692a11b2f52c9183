//! Threshold configuration and tier classification

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use vigil_common::Tier;

/// Tier floors for one scope
///
/// Valid only when `0 <= low < medium < high <= 100`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl ThresholdConfig {
    pub const fn new(high: f64, medium: f64, low: f64) -> Self {
        Self { high, medium, low }
    }

    /// Global fallback when no scope is configured
    pub const DEFAULT: ThresholdConfig = ThresholdConfig::new(89.0, 75.0, 50.0);

    pub fn validate(&self) -> Result<(), String> {
        let ThresholdConfig { high, medium, low } = *self;
        if [high, medium, low].iter().any(|v| !v.is_finite()) {
            return Err("thresholds must be finite numbers".to_string());
        }
        if !(0.0 <= low && low < medium && medium < high && high <= 100.0) {
            return Err(format!(
                "expected 0 <= low < medium < high <= 100, got low={} medium={} high={}",
                low, medium, high
            ));
        }
        Ok(())
    }

    /// Tier for `score`; every floor is exclusive
    ///
    /// - `score > high` → HIGH
    /// - `medium < score <= high` → MEDIUM
    /// - `low < score <= medium` → LOW
    /// - `score <= low` → no tier
    pub fn classify(&self, score: f64) -> Option<Tier> {
        if score > self.high {
            Some(Tier::High)
        } else if score > self.medium {
            Some(Tier::Medium)
        } else if score > self.low {
            Some(Tier::Low)
        } else {
            None
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Which link of the priority chain produced a config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdSource {
    User,
    Service,
    Global,
}

impl ThresholdSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdSource::User => "user",
            ThresholdSource::Service => "service",
            ThresholdSource::Global => "global",
        }
    }
}

impl fmt::Display for ThresholdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThresholdSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ThresholdSource::User),
            "service" => Ok(ThresholdSource::Service),
            "global" => Ok(ThresholdSource::Global),
            other => Err(format!("unknown threshold scope '{}'", other)),
        }
    }
}

/// Config plus provenance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedThresholds {
    pub config: ThresholdConfig,
    pub source: ThresholdSource,
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: ThresholdConfig = ThresholdConfig::new(89.0, 75.0, 50.0);

    #[test]
    fn test_classify_reference_scores() {
        assert_eq!(T.classify(95.0), Some(Tier::High));
        assert_eq!(T.classify(80.0), Some(Tier::Medium));
        assert_eq!(T.classify(60.0), Some(Tier::Low));
        assert_eq!(T.classify(40.0), None);
    }

    #[test]
    fn test_classify_boundaries_are_exclusive_floors() {
        assert_eq!(T.classify(89.0), Some(Tier::Medium));
        assert_eq!(T.classify(89.01), Some(Tier::High));
        assert_eq!(T.classify(75.0), Some(Tier::Low));
        assert_eq!(T.classify(50.0), None);
        assert_eq!(T.classify(50.01), Some(Tier::Low));
    }

    #[test]
    fn test_validate_accepts_ordered_tuple() {
        assert!(T.validate().is_ok());
        assert!(ThresholdConfig::new(100.0, 1.0, 0.0).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unordered_or_out_of_range() {
        let bad = [
            ThresholdConfig::new(75.0, 75.0, 50.0),
            ThresholdConfig::new(89.0, 50.0, 50.0),
            ThresholdConfig::new(89.0, 40.0, 50.0),
            ThresholdConfig::new(101.0, 75.0, 50.0),
            ThresholdConfig::new(89.0, 75.0, -1.0),
            ThresholdConfig::new(f64::NAN, 75.0, 50.0),
        ];
        for t in bad {
            assert!(t.validate().is_err(), "{:?} should be invalid", t);
        }
    }
}
