//! Alert payload types shared by the scan pipeline and the dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Threat tier assigned to a match score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    High,
    Medium,
    Low,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::High => "HIGH",
            Tier::Medium => "MEDIUM",
            Tier::Low => "LOW",
        }
    }

    /// Tiers that trigger immediate dispatch and location journaling
    pub fn is_notable(&self) -> bool {
        matches!(self, Tier::High | Tier::Medium)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HIGH" => Ok(Tier::High),
            "MEDIUM" => Ok(Tier::Medium),
            "LOW" => Ok(Tier::Low),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// WGS84 coordinate of the site that produced a scan
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

/// A classified scan result awaiting channel dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub scan_id: Uuid,
    pub account_id: String,
    pub tier: Tier,
    /// Top match score (0-100)
    pub score: f64,
    /// Matched subject, when the resolver identified one
    pub subject_id: Option<String>,
    pub location: Option<GeoPoint>,
    pub view_url: Option<String>,
    pub raised_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_string_round_trip() {
        for tier in [Tier::High, Tier::Medium, Tier::Low] {
            assert_eq!(tier.as_str().parse::<Tier>().unwrap(), tier);
        }
        assert!("CRITICAL".parse::<Tier>().is_err());
    }

    #[test]
    fn test_tier_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Tier::Medium).unwrap(), "\"MEDIUM\"");
    }

    #[test]
    fn test_geo_point_bounds() {
        assert!(GeoPoint { lat: 51.5, lon: -0.12 }.is_valid());
        assert!(!GeoPoint { lat: 91.0, lon: 0.0 }.is_valid());
        assert!(!GeoPoint { lat: 0.0, lon: -181.0 }.is_valid());
    }
}
