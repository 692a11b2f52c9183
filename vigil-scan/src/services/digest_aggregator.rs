//! Weekly Digest Aggregator
//!
//! Collects LOW-tier matches from the trailing seven days, collapses repeat
//! sightings of the same subject/feature vector into one row (highest score
//! wins), and mails one digest per account. Grouping for the whole run is
//! finished before the first email goes out.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vigil_common::config::DigestConfig;
use vigil_common::{time, Tier};

use crate::channels::{EmailError, EmailMessage, EmailSender};
use crate::db;
use crate::error::ScanResult;
use crate::models::{FeatureValue, ThresholdConfig};
use crate::services::threshold_resolver::ThresholdResolver;

const UNSUBSCRIBE_TOKEN_LEN: usize = 32;

/// Dedup key: `subject_id:sha256(sorted "name=value" pairs)`
///
/// Independent of feature order.
pub fn fingerprint(subject_id: &str, features: &[FeatureValue]) -> String {
    let mut pairs: Vec<String> = features
        .iter()
        .map(|f| format!("{}={}", f.name, f.value))
        .collect();
    pairs.sort();

    let mut hasher = Sha256::new();
    hasher.update(pairs.join(",").as_bytes());
    format!("{}:{:x}", subject_id, hasher.finalize())
}

/// Best sighting of one fingerprint within the window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestCandidate {
    pub fingerprint: String,
    pub scan_id: Uuid,
    pub subject_id: String,
    pub score: f64,
    pub view_url: Option<String>,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Skipped,
    OptedOut,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DigestRunReport {
    pub candidates: usize,
    pub accounts: usize,
    pub sent: usize,
    pub skipped: usize,
    pub opted_out: usize,
    pub failed: usize,
}

impl DigestRunReport {
    fn record(&mut self, status: DeliveryStatus) {
        match status {
            DeliveryStatus::Sent => self.sent += 1,
            DeliveryStatus::Skipped => self.skipped += 1,
            DeliveryStatus::OptedOut => self.opted_out += 1,
            DeliveryStatus::Failed => self.failed += 1,
        }
    }
}

/// Candidates for one run plus accounts whose thresholds could not be read
struct Gathered {
    by_account: BTreeMap<String, Vec<DigestCandidate>>,
    unresolved: BTreeSet<String>,
}

#[derive(Clone)]
pub struct DigestAggregator {
    db: SqlitePool,
    thresholds: ThresholdResolver,
    email: Arc<dyn EmailSender>,
    config: DigestConfig,
}

impl DigestAggregator {
    pub fn new(
        db: SqlitePool,
        thresholds: ThresholdResolver,
        email: Arc<dyn EmailSender>,
        config: DigestConfig,
    ) -> Self {
        Self {
            db,
            thresholds,
            email,
            config,
        }
    }

    /// Group the window's LOW-tier matches per account, deduplicated by fingerprint
    ///
    /// Scores are re-classified against each account's current thresholds.
    /// Accounts whose thresholds cannot be read are left out.
    pub async fn collect_candidates(&self, now: DateTime<Utc>) -> ScanResult<BTreeMap<String, Vec<DigestCandidate>>> {
        Ok(self.gather(now).await?.by_account)
    }

    async fn gather(&self, now: DateTime<Utc>) -> ScanResult<Gathered> {
        let scans = db::scans::list_completed_between(&self.db, time::digest_window_start(now), now).await?;

        let mut threshold_cache: HashMap<(String, Option<String>), ThresholdConfig> = HashMap::new();
        let mut grouped: BTreeMap<String, HashMap<String, DigestCandidate>> = BTreeMap::new();
        let mut unresolved: BTreeSet<String> = BTreeSet::new();

        for scan in scans {
            let (Some(score), Some(subject_id)) = (scan.top_score, scan.subject_id.as_deref()) else {
                continue;
            };
            if unresolved.contains(&scan.account_id) {
                continue;
            }

            let key = (scan.account_id.clone(), scan.service_id.clone());
            let thresholds = match threshold_cache.get(&key) {
                Some(config) => *config,
                None => match self
                    .thresholds
                    .resolve(&scan.account_id, scan.service_id.as_deref())
                    .await
                {
                    Ok(resolved) => {
                        threshold_cache.insert(key, resolved.config);
                        resolved.config
                    }
                    Err(e) => {
                        tracing::error!(
                            account_id = %scan.account_id,
                            error = %e,
                            "Threshold lookup failed, account left out of digest"
                        );
                        grouped.remove(&scan.account_id);
                        unresolved.insert(scan.account_id);
                        continue;
                    }
                },
            };
            if thresholds.classify(score) != Some(Tier::Low) {
                continue;
            }

            let candidate = DigestCandidate {
                fingerprint: fingerprint(subject_id, &scan.features),
                scan_id: scan.scan_id,
                subject_id: subject_id.to_string(),
                score,
                view_url: scan.view_url.clone(),
                seen_at: scan.updated_at,
            };

            let account = grouped.entry(scan.account_id).or_default();
            match account.get(&candidate.fingerprint) {
                Some(existing) if existing.score >= candidate.score => {}
                _ => {
                    account.insert(candidate.fingerprint.clone(), candidate);
                }
            }
        }

        let by_account = grouped
            .into_iter()
            .map(|(account, by_fingerprint)| {
                let mut rows: Vec<DigestCandidate> = by_fingerprint.into_values().collect();
                rows.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
                (account, rows)
            })
            .collect();
        Ok(Gathered { by_account, unresolved })
    }

    /// One full aggregation pass
    ///
    /// A failure confined to one account is counted as `failed` for that
    /// account; only a failure to read the window at all aborts the run.
    pub async fn run(&self, now: DateTime<Utc>) -> ScanResult<DigestRunReport> {
        let Gathered { by_account, unresolved } = self.gather(now).await?;

        let mut report = DigestRunReport {
            candidates: by_account.values().map(Vec::len).sum(),
            accounts: by_account.len() + unresolved.len(),
            ..Default::default()
        };

        for (account_id, candidates) in &by_account {
            let status = match self.deliver(account_id, candidates).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!(account_id = %account_id, error = %e, "Digest delivery failed");
                    DeliveryStatus::Failed
                }
            };
            report.record(status);
        }
        for _ in &unresolved {
            report.record(DeliveryStatus::Failed);
        }

        tracing::info!(
            accounts = report.accounts,
            candidates = report.candidates,
            sent = report.sent,
            skipped = report.skipped,
            opted_out = report.opted_out,
            failed = report.failed,
            "Weekly digest run finished"
        );
        Ok(report)
    }

    async fn deliver(&self, account_id: &str, candidates: &[DigestCandidate]) -> ScanResult<DeliveryStatus> {
        let Some(profile) = db::profiles::get_profile(&self.db, account_id).await? else {
            tracing::debug!(account_id, "No profile, skipping digest");
            return Ok(DeliveryStatus::Skipped);
        };
        if profile.digest_opt_out {
            return Ok(DeliveryStatus::Skipped);
        }
        let Some(email) = profile.email.filter(|e| looks_like_email(e)) else {
            tracing::debug!(account_id, "No usable email address, skipping digest");
            return Ok(DeliveryStatus::Skipped);
        };

        let token =
            db::profiles::ensure_unsubscribe_token(&self.db, account_id, &new_unsubscribe_token()).await?;
        let message = EmailMessage {
            to: email,
            subject: format!("Weekly threat digest: {} low-confidence matches", candidates.len()),
            html: render_digest(candidates, &self.unsubscribe_link(&token)),
        };

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.email.send_email(&message).await {
                Ok(message_id) => {
                    tracing::info!(account_id, message_id = %message_id, rows = candidates.len(), "Digest sent");
                    return Ok(DeliveryStatus::Sent);
                }
                Err(EmailError::InvalidAddress(reason)) => {
                    tracing::warn!(account_id, reason = %reason, "Digest address rejected, opting account out");
                    db::profiles::set_digest_opt_out(&self.db, account_id).await?;
                    return Ok(DeliveryStatus::OptedOut);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.retry_base_delay_ms.saturating_mul(1u64 << (attempt - 1).min(16));
                    tracing::warn!(account_id, attempt, delay_ms = delay, error = %e, "Digest send failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(account_id, attempt, error = %e, "Digest send failed");
                    return Ok(DeliveryStatus::Failed);
                }
            }
        }
    }

    fn unsubscribe_link(&self, token: &str) -> String {
        format!("{}?token={}", self.config.unsubscribe_base_url, token)
    }

    /// Run weekly (per `interval_hours`) until cancelled; first run after one interval
    pub fn spawn_schedule(self, cancel: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.interval_hours.max(1) * 3600);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run(Utc::now()).await {
                            tracing::error!(error = %e, "Weekly digest run failed");
                        }
                    }
                }
            }
            tracing::info!("Digest schedule stopped");
        })
    }
}

fn new_unsubscribe_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(UNSUBSCRIBE_TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn looks_like_email(address: &str) -> bool {
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !address.chars().any(char::is_whitespace)
}

fn render_digest(candidates: &[DigestCandidate], unsubscribe_url: &str) -> String {
    let mut html = String::from("<h1>Weekly threat digest</h1>\n<table>\n<tr><th>Subject</th><th>Score</th><th>Last seen</th><th></th></tr>\n");
    for candidate in candidates {
        let link = candidate
            .view_url
            .as_deref()
            .map(|url| format!("<a href=\"{}\">view</a>", escape_html(url)))
            .unwrap_or_default();
        html.push_str(&format!(
            "<tr><td>{}</td><td>{:.0}</td><td>{}</td><td>{}</td></tr>\n",
            escape_html(&candidate.subject_id),
            candidate.score,
            candidate.seen_at.format("%Y-%m-%d %H:%M UTC"),
            link
        ));
    }
    html.push_str(&format!(
        "</table>\n<p><a href=\"{}\">Unsubscribe</a></p>\n",
        escape_html(unsubscribe_url)
    ));
    html
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
