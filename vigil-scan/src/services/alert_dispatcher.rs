//! Alert Dispatcher
//!
//! Routing by tier:
//! - HIGH: SMS, push, webhooks, threat-location journal
//! - MEDIUM: push
//! - LOW: nothing (digest only)
//!
//! Channels for one alert run concurrently. A failing channel is logged and
//! recorded in the [`DispatchReport`]; it never prevents its siblings from
//! running.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vigil_common::config::AlertsConfig;
use vigil_common::{AlertEvent, EventBus, ThreatEvent, Tier};

use crate::channels::{ChannelError, PushNotification, PushSender, SmsSender, WebhookSender};
use crate::db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Sms,
    Push,
    Webhook,
    LocationJournal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChannelOutcome {
    Delivered { detail: String },
    Skipped { reason: String },
    Failed { error: String },
}

impl ChannelOutcome {
    fn delivered(detail: impl Into<String>) -> Self {
        ChannelOutcome::Delivered { detail: detail.into() }
    }

    fn skipped(reason: impl Into<String>) -> Self {
        ChannelOutcome::Skipped { reason: reason.into() }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ChannelOutcome::Failed { .. })
    }
}

/// Per-channel results for one alert
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub scan_id: Uuid,
    pub tier: Tier,
    pub outcomes: Vec<(ChannelKind, ChannelOutcome)>,
}

impl DispatchReport {
    pub fn outcome(&self, kind: ChannelKind) -> Option<&ChannelOutcome> {
        self.outcomes.iter().find(|(k, _)| *k == kind).map(|(_, o)| o)
    }

    pub fn failed_channels(&self) -> Vec<ChannelKind> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.is_failed())
            .map(|(k, _)| *k)
            .collect()
    }
}

/// Webhook fan-out tally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutSummary {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct AlertDispatcher {
    db: SqlitePool,
    event_bus: EventBus,
    sms: Option<Arc<dyn SmsSender>>,
    push: Option<Arc<dyn PushSender>>,
    webhooks: Arc<dyn WebhookSender>,
    webhook_concurrency: usize,
    webhook_timeout: Duration,
    max_in_flight: usize,
}

impl AlertDispatcher {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        sms: Option<Arc<dyn SmsSender>>,
        push: Option<Arc<dyn PushSender>>,
        webhooks: Arc<dyn WebhookSender>,
        config: &AlertsConfig,
    ) -> Self {
        Self {
            db,
            event_bus,
            sms,
            push,
            webhooks,
            webhook_concurrency: config.webhook_concurrency.max(1),
            webhook_timeout: Duration::from_millis(config.webhook_timeout_ms),
            max_in_flight: config.max_concurrent_dispatches.max(1),
        }
    }

    /// Deliver one alert over every channel its tier routes to
    pub async fn dispatch(&self, alert: &AlertEvent) -> DispatchReport {
        let outcomes = match alert.tier {
            Tier::High => {
                let (sms, push, webhook, journal) = tokio::join!(
                    guarded(ChannelKind::Sms, alert, self.send_sms(alert)),
                    guarded(ChannelKind::Push, alert, self.send_push(alert)),
                    guarded(ChannelKind::Webhook, alert, self.fan_out_webhooks(alert)),
                    guarded(ChannelKind::LocationJournal, alert, self.record_location(alert)),
                );
                vec![sms, push, webhook, journal]
            }
            Tier::Medium => vec![guarded(ChannelKind::Push, alert, self.send_push(alert)).await],
            Tier::Low => Vec::new(),
        };

        let report = DispatchReport {
            scan_id: alert.scan_id,
            tier: alert.tier,
            outcomes,
        };
        tracing::info!(
            scan_id = %alert.scan_id,
            tier = %alert.tier,
            channels = report.outcomes.len(),
            failed = report.failed_channels().len(),
            "Alert dispatched"
        );
        report
    }

    async fn send_sms(&self, alert: &AlertEvent) -> Result<ChannelOutcome, DispatchFailure> {
        let Some(sms) = &self.sms else {
            return Ok(ChannelOutcome::skipped("sms provider not configured"));
        };
        let phone = db::profiles::get_profile(&self.db, &alert.account_id)
            .await?
            .and_then(|p| p.phone);
        let Some(phone) = phone else {
            return Ok(ChannelOutcome::skipped("no phone number on account"));
        };

        let message_id = sms.send_sms(&phone, &sms_body(alert)).await?;
        Ok(ChannelOutcome::delivered(message_id))
    }

    async fn send_push(&self, alert: &AlertEvent) -> Result<ChannelOutcome, DispatchFailure> {
        let Some(push) = &self.push else {
            return Ok(ChannelOutcome::skipped("push provider not configured"));
        };
        let tokens = db::devices::list_active_tokens(&self.db, &alert.account_id).await?;
        if tokens.is_empty() {
            return Ok(ChannelOutcome::skipped("no active device tokens"));
        }

        let outcome = push.send_batch(&tokens, &push_notification(alert)).await?;
        for (token, reason) in &outcome.failed {
            if let Err(e) = db::devices::mark_failed(&self.db, token, reason).await {
                tracing::warn!(account_id = %alert.account_id, error = %e, "Could not mark failed device token");
            }
        }

        Ok(ChannelOutcome::delivered(format!(
            "{} of {} devices",
            outcome.delivered,
            tokens.len()
        )))
    }

    async fn fan_out_webhooks(&self, alert: &AlertEvent) -> Result<ChannelOutcome, DispatchFailure> {
        let subscriptions = db::webhooks::list_enabled(&self.db, &alert.account_id).await?;
        if subscriptions.is_empty() {
            return Ok(ChannelOutcome::skipped("no webhook subscriptions"));
        }

        let payload = json!({ "event": "threat.alert", "alert": alert });
        let summary = self.post_all(&subscriptions, &payload).await;

        self.event_bus.publish_lossy(ThreatEvent::WebhookFanout {
            scan_id: alert.scan_id,
            account_id: alert.account_id.clone(),
            delivered: summary.delivered,
            failed: summary.failed,
            timestamp: Utc::now(),
        });

        let detail = format!("{} delivered, {} failed", summary.delivered, summary.failed);
        if summary.failed > 0 {
            Err(DispatchFailure(detail))
        } else {
            Ok(ChannelOutcome::delivered(detail))
        }
    }

    /// Bounded-concurrency POST to every subscription; failures are tallied, not retried
    async fn post_all(
        &self,
        subscriptions: &[db::webhooks::WebhookSubscription],
        payload: &serde_json::Value,
    ) -> FanoutSummary {
        let timeout = self.webhook_timeout;
        let webhooks = self.webhooks.clone();
        let payload = payload.clone();
        let results: Vec<bool> = stream::iter(subscriptions.to_vec())
            .map(move |subscription| {
                let webhooks = webhooks.clone();
                let payload = payload.clone();
                async move {
                    let result = match tokio::time::timeout(timeout, webhooks.post(&subscription.url, &payload)).await {
                        Ok(result) => result,
                        Err(_) => Err(ChannelError::Timeout(timeout.as_millis() as u64)),
                    };
                    if let Err(e) = &result {
                        tracing::warn!(
                            subscription_id = %subscription.subscription_id,
                            error = %e,
                            "Webhook delivery failed"
                        );
                    }
                    result.is_ok()
                }
            })
            .buffer_unordered(self.webhook_concurrency)
            .collect()
            .await;

        let delivered = results.iter().filter(|ok| **ok).count();
        FanoutSummary {
            delivered,
            failed: results.len() - delivered,
        }
    }

    async fn record_location(&self, alert: &AlertEvent) -> Result<ChannelOutcome, DispatchFailure> {
        let (Some(subject_id), Some(location)) = (&alert.subject_id, alert.location) else {
            return Ok(ChannelOutcome::skipped("no subject or location"));
        };
        db::journal::append_location(&self.db, subject_id, alert.scan_id, location, alert.raised_at).await?;
        Ok(ChannelOutcome::delivered(subject_id.clone()))
    }

    /// Consume the high- and medium-threat work queues until cancelled
    ///
    /// Each alert is dispatched on its own task so a slow channel never holds
    /// up the next alert. At most `max_concurrent_dispatches` tasks run at
    /// once; beyond that, alerts wait in their queue. High-threat alerts are
    /// taken first when both queues have work.
    pub async fn run(
        self,
        mut high: mpsc::Receiver<ThreatEvent>,
        mut medium: mpsc::Receiver<ThreatEvent>,
        cancel: CancellationToken,
    ) {
        tracing::info!(max_in_flight = self.max_in_flight, "Alert dispatcher started");
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(event) = high.recv() => event,
                Some(event) = medium.recv() => event,
                else => break,
            };

            let ThreatEvent::AlertRaised { alert } = event else {
                continue;
            };
            if !alert.tier.is_notable() {
                continue;
            }
            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.dispatch(&alert).await;
                drop(permit);
            });
        }
        tracing::info!("Alert dispatcher stopped");
    }
}

/// Any error a channel can hit, flattened to a message for the report
#[derive(Debug)]
struct DispatchFailure(String);

impl From<ChannelError> for DispatchFailure {
    fn from(err: ChannelError) -> Self {
        DispatchFailure(err.to_string())
    }
}

impl From<vigil_common::Error> for DispatchFailure {
    fn from(err: vigil_common::Error) -> Self {
        DispatchFailure(err.to_string())
    }
}

async fn guarded<F>(kind: ChannelKind, alert: &AlertEvent, channel: F) -> (ChannelKind, ChannelOutcome)
where
    F: Future<Output = Result<ChannelOutcome, DispatchFailure>>,
{
    match channel.await {
        Ok(outcome) => (kind, outcome),
        Err(DispatchFailure(error)) => {
            tracing::warn!(
                scan_id = %alert.scan_id,
                channel = ?kind,
                error = %error,
                "Alert channel failed"
            );
            (kind, ChannelOutcome::Failed { error })
        }
    }
}

fn sms_body(alert: &AlertEvent) -> String {
    let mut body = format!("VIGIL {} threat: match score {:.0}", alert.tier, alert.score);
    if let Some(subject) = &alert.subject_id {
        body.push_str(&format!(" for subject {}", subject));
    }
    if let Some(url) = &alert.view_url {
        body.push_str(&format!(". View: {}", url));
    }
    body
}

fn push_notification(alert: &AlertEvent) -> PushNotification {
    PushNotification {
        title: format!("{} threat detected", alert.tier),
        body: format!("Match score {:.0}", alert.score),
        data: json!({
            "scan_id": alert.scan_id,
            "tier": alert.tier,
            "view_url": alert.view_url,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_common::GeoPoint;

    fn alert(tier: Tier) -> AlertEvent {
        AlertEvent {
            scan_id: Uuid::new_v4(),
            account_id: "acct".into(),
            tier,
            score: 95.4,
            subject_id: Some("subj-1".into()),
            location: Some(GeoPoint { lat: 1.0, lon: 2.0 }),
            view_url: Some("https://view/1".into()),
            raised_at: Utc::now(),
        }
    }

    #[test]
    fn test_sms_body_mentions_tier_and_link() {
        let body = sms_body(&alert(Tier::High));
        assert!(body.starts_with("VIGIL HIGH threat: match score 95"));
        assert!(body.contains("subj-1"));
        assert!(body.ends_with("View: https://view/1"));
    }

    #[test]
    fn test_report_lists_failed_channels() {
        let report = DispatchReport {
            scan_id: Uuid::new_v4(),
            tier: Tier::High,
            outcomes: vec![
                (ChannelKind::Sms, ChannelOutcome::Failed { error: "boom".into() }),
                (ChannelKind::Push, ChannelOutcome::delivered("1 of 1 devices")),
            ],
        };
        assert_eq!(report.failed_channels(), vec![ChannelKind::Sms]);
        assert!(matches!(report.outcome(ChannelKind::Push), Some(ChannelOutcome::Delivered { .. })));
        assert!(report.outcome(ChannelKind::Webhook).is_none());
    }
}
