//! Scan Orchestrator
//!
//! Admission, submission and the immediate-result path of the scan lifecycle:
//!
//! ```text
//! CREATED -> SUBMITTED -> RESOLVED_IMMEDIATE -> COMPLETED
//!                      \-> DEFERRED (handed to the poll worker)
//!          any non-terminal -> FAILED
//! ```
//!
//! Quota is reserved before the resolver is called, so a scan that fails
//! upstream still counts against the account. The reservation is released
//! only when consent is denied, because no external work happened.

use std::sync::Arc;

use chrono::Utc;
use reqwest::Url;
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;
use vigil_common::config::ResolverConfig;
use vigil_common::{time, AlertEvent, EventBus, ThreatEvent};

use crate::db;
use crate::error::{ScanError, ScanResult};
use crate::models::{
    top_match, ImageInput, ResolvedMatch, Scan, ScanState, SiteMeta, ThresholdConfig, ThresholdSource,
};
use crate::services::consent_gate::ConsentGate;
use crate::services::quota_ledger::QuotaLedger;
use crate::services::resolution_client::Resolver;
use crate::services::threshold_resolver::ThresholdResolver;

const MAX_ACCOUNT_ID_LEN: usize = 128;

/// Inbound scan request
#[derive(Debug)]
pub struct ScanRequest {
    pub account_id: String,
    pub service_id: Option<String>,
    pub image: ImageInput,
    pub site: SiteMeta,
}

/// Result handed back to the caller
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "scan", rename_all = "snake_case")]
pub enum ScanOutcome {
    /// Resolved within the submit call
    Completed(Scan),
    /// Resolver deferred the job; the poll worker will finish the scan
    Pending(Scan),
}

impl ScanOutcome {
    pub fn scan(&self) -> &Scan {
        match self {
            ScanOutcome::Completed(scan) | ScanOutcome::Pending(scan) => scan,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ScanOutcome::Pending(_))
    }
}

#[derive(Clone)]
pub struct ScanOrchestrator {
    db: SqlitePool,
    event_bus: EventBus,
    quota: QuotaLedger,
    consent: ConsentGate,
    thresholds: ThresholdResolver,
    resolver: Arc<dyn Resolver>,
    max_image_bytes: usize,
}

impl ScanOrchestrator {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        quota: QuotaLedger,
        consent: ConsentGate,
        thresholds: ThresholdResolver,
        resolver: Arc<dyn Resolver>,
        config: &ResolverConfig,
    ) -> Self {
        Self {
            db,
            event_bus,
            quota,
            consent,
            thresholds,
            resolver,
            max_image_bytes: config.max_image_bytes,
        }
    }

    pub async fn submit_scan(&self, request: ScanRequest) -> ScanResult<ScanOutcome> {
        self.validate(&request)?;

        let ScanRequest {
            account_id,
            service_id,
            image,
            site,
        } = request;
        let period = time::period_key(Utc::now());

        self.quota.pre_check(&account_id, &period).await?;
        self.quota.reserve(&account_id, &period).await?;

        let allowed = match self.consent.is_allowed(&account_id).await {
            Ok(allowed) => allowed,
            Err(e) => {
                self.release_quietly(&account_id, &period).await;
                return Err(e);
            }
        };
        if !allowed {
            self.release_quietly(&account_id, &period).await;
            tracing::info!(account_id = %account_id, "Scan rejected: consent withheld");
            return Err(ScanError::ConsentDenied);
        }

        if let Err(e) = self.quota.warn_if_needed(&account_id).await {
            tracing::warn!(account_id = %account_id, error = %e, "Quota warning check failed");
        }

        let mut scan = Scan::new(account_id, service_id);
        scan.site_id = site.site_id.clone();
        scan.location = site.location;
        db::scans::insert_scan(&self.db, &scan).await?;
        advance(&self.db, &mut scan, ScanState::Submitted).await?;

        tracing::info!(
            scan_id = %scan.scan_id,
            account_id = %scan.account_id,
            image_bytes = ?image.byte_len(),
            "Submitting scan to resolver"
        );

        let submitted = self.resolver.submit(&image, &site).await;
        drop(image);

        let submission = match submitted {
            Ok(submission) => submission,
            Err(e) => {
                tracing::warn!(scan_id = %scan.scan_id, error = %e, "Resolver submit failed");
                scan.failure_reason = Some(e.to_string());
                advance(&self.db, &mut scan, ScanState::Failed).await?;
                return Err(e.into());
            }
        };

        scan.external_job_id = Some(submission.job_id.clone());
        scan.credential_ref = Some(submission.credential_ref.clone());

        if submission.deferred {
            scan.polling_required = true;
            advance(&self.db, &mut scan, ScanState::Deferred).await?;

            self.event_bus.publish(ThreatEvent::ScanDeferred {
                scan_id: scan.scan_id,
                account_id: scan.account_id.clone(),
                job_id: submission.job_id,
                timestamp: Utc::now(),
            });
            tracing::info!(scan_id = %scan.scan_id, "Scan deferred for polling");
            return Ok(ScanOutcome::Pending(scan));
        }

        advance(&self.db, &mut scan, ScanState::ResolvedImmediate).await?;
        let source = complete_scan(
            &self.db,
            &self.thresholds,
            &mut scan,
            &submission.matches,
            submission.view_url,
        )
        .await?;

        tracing::info!(
            scan_id = %scan.scan_id,
            score = ?scan.top_score,
            tier = ?scan.match_tier,
            threshold_source = %source,
            "Scan resolved immediately"
        );

        if let Some(alert) = alert_for(&scan) {
            self.event_bus.publish(ThreatEvent::AlertRaised { alert });
        }

        Ok(ScanOutcome::Completed(scan))
    }

    pub async fn get_scan(&self, scan_id: Uuid) -> ScanResult<Scan> {
        db::scans::load_scan(&self.db, scan_id)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("scan {}", scan_id)))
    }

    fn validate(&self, request: &ScanRequest) -> ScanResult<()> {
        let account_id = request.account_id.trim();
        if account_id.is_empty() {
            return Err(ScanError::Validation("account_id is required".into()));
        }
        if account_id.len() > MAX_ACCOUNT_ID_LEN {
            return Err(ScanError::Validation("account_id is too long".into()));
        }
        if matches!(&request.service_id, Some(s) if s.trim().is_empty()) {
            return Err(ScanError::Validation("service_id must not be blank".into()));
        }

        match &request.image {
            ImageInput::Url(url) => {
                let parsed = Url::parse(url).map_err(|_| ScanError::Validation("image_url is not a valid URL".into()))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(ScanError::Validation("image_url must be http or https".into()));
                }
            }
            ImageInput::Bytes(bytes) => {
                if bytes.is_empty() {
                    return Err(ScanError::Validation("image is empty".into()));
                }
                if bytes.len() > self.max_image_bytes {
                    return Err(ScanError::Validation(format!(
                        "image exceeds {} bytes",
                        self.max_image_bytes
                    )));
                }
            }
        }

        if let Some(location) = &request.site.location {
            if !location.is_valid() {
                return Err(ScanError::Validation("site location out of range".into()));
            }
        }
        Ok(())
    }

    async fn release_quietly(&self, account_id: &str, period: &str) {
        if let Err(e) = self.quota.release(account_id, period).await {
            tracing::error!(account_id, error = %e, "Failed to release quota reservation");
        }
    }
}

/// Apply a state edge in memory and persist it as a compare-and-set
///
/// The in-memory state is rolled back when the write fails.
pub(crate) async fn advance(pool: &SqlitePool, scan: &mut Scan, next: ScanState) -> ScanResult<()> {
    let previous = scan.state;
    let previous_updated_at = scan.updated_at;
    scan.transition_to(next).map_err(ScanError::InvalidTransition)?;

    let saved = match db::scans::save_transition(pool, scan, previous).await {
        Ok(saved) => saved,
        Err(e) => {
            scan.state = previous;
            scan.updated_at = previous_updated_at;
            return Err(e.into());
        }
    };
    if !saved {
        scan.state = previous;
        scan.updated_at = previous_updated_at;
        return Err(ScanError::InvalidTransition(format!(
            "scan {} changed concurrently ({} -> {})",
            scan.scan_id, previous, next
        )));
    }
    Ok(())
}

/// Classify a resolved job and persist `COMPLETED`
///
/// Any error on the way marks the scan `FAILED` before it is returned, so a
/// resolved scan never stays parked in a non-terminal state.
pub(crate) async fn complete_scan(
    pool: &SqlitePool,
    thresholds: &ThresholdResolver,
    scan: &mut Scan,
    matches: &[ResolvedMatch],
    view_url: Option<String>,
) -> ScanResult<ThresholdSource> {
    let completed: ScanResult<ThresholdSource> = async {
        let resolved = thresholds
            .resolve(&scan.account_id, scan.service_id.as_deref())
            .await?;
        record_matches(scan, matches, view_url, &resolved.config);
        advance(pool, scan, ScanState::Completed).await?;
        Ok::<_, ScanError>(resolved.source)
    }
    .await;

    if let Err(e) = &completed {
        tracing::error!(scan_id = %scan.scan_id, error = %e, "Could not complete resolved scan");
        scan.failure_reason = Some(format!("completion failed: {}", e));
        if let Err(mark) = advance(pool, scan, ScanState::Failed).await {
            tracing::error!(scan_id = %scan.scan_id, error = %mark, "Could not mark scan failed");
        }
    }
    completed
}

/// Copy the best match onto the scan and classify it
pub(crate) fn record_matches(
    scan: &mut Scan,
    matches: &[ResolvedMatch],
    view_url: Option<String>,
    thresholds: &ThresholdConfig,
) {
    scan.view_url = view_url;
    match top_match(matches) {
        Some(best) => {
            scan.top_score = Some(best.score);
            scan.subject_id = Some(best.subject_id.clone());
            scan.features = best.features.clone();
            scan.match_tier = thresholds.classify(best.score);
        }
        None => {
            scan.top_score = None;
            scan.match_tier = None;
        }
    }
}

/// Alert for a completed scan; only HIGH and MEDIUM are dispatched
pub(crate) fn alert_for(scan: &Scan) -> Option<AlertEvent> {
    let tier = scan.match_tier.filter(|t| t.is_notable())?;
    Some(AlertEvent {
        scan_id: scan.scan_id,
        account_id: scan.account_id.clone(),
        tier,
        score: scan.top_score?,
        subject_id: scan.subject_id.clone(),
        location: scan.location,
        view_url: scan.view_url.clone(),
        raised_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FeatureValue;
    use vigil_common::Tier;

    fn matches() -> Vec<ResolvedMatch> {
        vec![
            ResolvedMatch {
                subject_id: "low".into(),
                score: 40.0,
                features: Vec::new(),
            },
            ResolvedMatch {
                subject_id: "best".into(),
                score: 80.0,
                features: vec![FeatureValue {
                    name: "jaw".into(),
                    value: 0.3,
                }],
            },
        ]
    }

    #[test]
    fn test_record_matches_uses_top_score() {
        let mut scan = Scan::new("acct".into(), None);
        record_matches(&mut scan, &matches(), Some("https://v".into()), &ThresholdConfig::DEFAULT);
        assert_eq!(scan.top_score, Some(80.0));
        assert_eq!(scan.subject_id.as_deref(), Some("best"));
        assert_eq!(scan.match_tier, Some(Tier::Medium));
        assert_eq!(scan.features.len(), 1);
    }

    #[test]
    fn test_no_matches_leaves_scan_unclassified() {
        let mut scan = Scan::new("acct".into(), None);
        record_matches(&mut scan, &[], None, &ThresholdConfig::DEFAULT);
        assert!(scan.top_score.is_none());
        assert!(alert_for(&scan).is_none());
    }

    #[test]
    fn test_low_tier_raises_no_alert() {
        let mut scan = Scan::new("acct".into(), None);
        scan.top_score = Some(60.0);
        scan.match_tier = Some(Tier::Low);
        assert!(alert_for(&scan).is_none());

        scan.match_tier = Some(Tier::High);
        assert_eq!(alert_for(&scan).map(|a| a.tier), Some(Tier::High));
    }
}
