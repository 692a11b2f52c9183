//! Scan lifecycle state machine
//!
//! CREATED → SUBMITTED → {RESOLVED_IMMEDIATE | DEFERRED} → COMPLETED | FAILED | TIMED_OUT
//!
//! Terminal states are immutable; the same rule is enforced in SQL by
//! `db::scans::save_transition`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use vigil_common::{GeoPoint, Tier};

use super::FeatureValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanState {
    /// Admitted, record persisted
    Created,
    /// Handed to the external resolver
    Submitted,
    /// Resolver answered within the submit budget
    ResolvedImmediate,
    /// Resolver accepted a job that must be polled
    Deferred,
    Completed,
    Failed,
    TimedOut,
}

impl ScanState {
    pub const TERMINAL: [ScanState; 3] = [ScanState::Completed, ScanState::Failed, ScanState::TimedOut];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Created => "CREATED",
            ScanState::Submitted => "SUBMITTED",
            ScanState::ResolvedImmediate => "RESOLVED_IMMEDIATE",
            ScanState::Deferred => "DEFERRED",
            ScanState::Completed => "COMPLETED",
            ScanState::Failed => "FAILED",
            ScanState::TimedOut => "TIMED_OUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Legal forward edges of the lifecycle
    pub fn can_transition_to(&self, next: ScanState) -> bool {
        use ScanState::*;
        matches!(
            (self, next),
            (Created, Submitted)
                | (Created, Failed)
                | (Submitted, ResolvedImmediate)
                | (Submitted, Deferred)
                | (Submitted, Failed)
                | (ResolvedImmediate, Completed)
                | (ResolvedImmediate, Failed)
                | (Deferred, Completed)
                | (Deferred, Failed)
                | (Deferred, TimedOut)
        )
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CREATED" => ScanState::Created,
            "SUBMITTED" => ScanState::Submitted,
            "RESOLVED_IMMEDIATE" => ScanState::ResolvedImmediate,
            "DEFERRED" => ScanState::Deferred,
            "COMPLETED" => ScanState::Completed,
            "FAILED" => ScanState::Failed,
            "TIMED_OUT" => ScanState::TimedOut,
            other => return Err(format!("unknown scan state '{}'", other)),
        })
    }
}

/// Persisted scan record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scan {
    pub scan_id: Uuid,
    pub account_id: String,
    pub service_id: Option<String>,
    pub external_job_id: Option<String>,
    pub state: ScanState,
    pub top_score: Option<f64>,
    pub match_tier: Option<Tier>,
    pub view_url: Option<String>,
    pub polling_required: bool,
    /// Non-secret reference to the resolver credential used for this scan
    pub credential_ref: Option<String>,
    /// Subject of the top match
    pub subject_id: Option<String>,
    /// Biometric feature vector of the top match (used for digest dedup)
    pub features: Vec<FeatureValue>,
    pub site_id: Option<String>,
    pub location: Option<GeoPoint>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Scan {
    pub fn new(account_id: String, service_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            scan_id: Uuid::new_v4(),
            account_id,
            service_id,
            external_job_id: None,
            state: ScanState::Created,
            top_score: None,
            match_tier: None,
            view_url: None,
            polling_required: false,
            credential_ref: None,
            subject_id: None,
            features: Vec::new(),
            site_id: None,
            location: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, refusing illegal edges and any exit from a terminal state
    pub fn transition_to(&mut self, next: ScanState) -> Result<(), String> {
        if !self.state.can_transition_to(next) {
            return Err(format!("{} -> {}", self.state, next));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}
