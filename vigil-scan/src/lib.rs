//! vigil-scan library interface
//!
//! Wires the scan pipeline (admission, resolution, classification, alert
//! dispatch, weekly digest) behind an axum router and a set of background
//! workers. Exposed as a library for integration testing.

pub mod api;
pub mod channels;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult, ScanError, ScanResult};

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use vigil_common::config::TomlConfig;
use vigil_common::{EventBus, Topic};

use crate::channels::{
    ChannelError, EmailSender, HttpEmailSender, HttpPushSender, HttpSmsSender, HttpWebhookSender, PushSender,
    SmsSender, WebhookSender,
};
use crate::services::{
    AlertDispatcher, ConsentGate, CredentialProvider, DigestAggregator, GlobalThresholdCache, PollWorker,
    QuotaLedger, ResolutionClient, ResolutionError, Resolver, ScanOrchestrator, ThresholdResolver,
};

/// Capacity of the in-process event bus
const EVENT_BUS_CAPACITY: usize = 1024;

/// Outbound notification channels
///
/// SMS, push and email are optional: a missing provider section leaves the
/// channel unconfigured and the dispatcher records it as skipped.
#[derive(Clone)]
pub struct Channels {
    pub sms: Option<Arc<dyn SmsSender>>,
    pub push: Option<Arc<dyn PushSender>>,
    pub webhooks: Arc<dyn WebhookSender>,
    pub email: Option<Arc<dyn EmailSender>>,
}

impl Channels {
    /// HTTP-backed channels for every configured provider
    pub fn from_config(config: &TomlConfig) -> Result<Self, ChannelError> {
        let alerts = &config.alerts;

        let sms: Option<Arc<dyn SmsSender>> = match &config.sms {
            Some(sms) => Some(Arc::new(HttpSmsSender::new(
                sms.clone(),
                Duration::from_millis(alerts.sms_timeout_ms),
            )?)),
            None => None,
        };
        let push: Option<Arc<dyn PushSender>> = match &config.push {
            Some(push) => Some(Arc::new(HttpPushSender::new(
                push.clone(),
                Duration::from_millis(alerts.push_timeout_ms),
            )?)),
            None => None,
        };
        let email: Option<Arc<dyn EmailSender>> = match &config.email {
            Some(email) => Some(Arc::new(
                HttpEmailSender::new(email.clone(), Duration::from_millis(config.digest.send_timeout_ms))
                    .map_err(|e| ChannelError::Network(e.to_string()))?,
            )),
            None => None,
        };
        let webhooks = Arc::new(HttpWebhookSender::new(Duration::from_millis(alerts.webhook_timeout_ms))?);

        Ok(Self {
            sms,
            push,
            webhooks,
            email,
        })
    }
}

/// Application state shared across handlers and workers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub orchestrator: ScanOrchestrator,
    pub thresholds: ThresholdResolver,
    pub poll_worker: PollWorker,
    pub dispatcher: AlertDispatcher,
    /// Absent when no email provider is configured or the digest is disabled
    pub digest: Option<DigestAggregator>,
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    /// Assemble the pipeline around an explicit resolver and channel set
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        config: &TomlConfig,
        resolver: Arc<dyn Resolver>,
        channels: Channels,
    ) -> Self {
        let thresholds = ThresholdResolver::new(db.clone(), GlobalThresholdCache::new());
        let quota = QuotaLedger::new(db.clone(), event_bus.clone(), &config.quota);
        let consent = ConsentGate::new(db.clone());

        let orchestrator = ScanOrchestrator::new(
            db.clone(),
            event_bus.clone(),
            quota,
            consent,
            thresholds.clone(),
            Arc::clone(&resolver),
            &config.resolver,
        );
        let poll_worker = PollWorker::new(
            db.clone(),
            event_bus.clone(),
            resolver,
            thresholds.clone(),
            &config.resolver,
        );
        let dispatcher = AlertDispatcher::new(
            db.clone(),
            event_bus.clone(),
            channels.sms,
            channels.push,
            channels.webhooks,
            &config.alerts,
        );
        let digest = match channels.email {
            Some(email) if config.digest.enabled => Some(DigestAggregator::new(
                db.clone(),
                thresholds.clone(),
                email,
                config.digest.clone(),
            )),
            _ => None,
        };

        Self {
            db,
            event_bus,
            orchestrator,
            thresholds,
            poll_worker,
            dispatcher,
            digest,
            startup_time: Utc::now(),
        }
    }

    /// Production wiring: HTTP resolver client and HTTP channels
    pub fn from_config(db: SqlitePool, config: &TomlConfig) -> anyhow::Result<Self> {
        let credentials = Arc::new(CredentialProvider::new(db.clone(), config.resolver.api_key.clone()));
        let resolver: Arc<dyn Resolver> = Arc::new(
            ResolutionClient::new(config.resolver.clone(), credentials)
                .map_err(|e: ResolutionError| anyhow::anyhow!("resolver client: {}", e))?,
        );
        let channels = Channels::from_config(config)?;

        Ok(Self::new(db, EventBus::new(EVENT_BUS_CAPACITY), config, resolver, channels))
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::scan_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the poll worker, alert dispatcher and digest schedule
///
/// The workers claim their bus work queues; events published before this
/// call wait in those queues. Calling it twice for the same state starts no
/// second set of queue consumers.
pub fn spawn_workers(state: &AppState, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let bus = &state.event_bus;

    match bus.take_work_queue(Topic::DeferredScans) {
        Some(rx) => handles.push(tokio::spawn(state.poll_worker.clone().run(rx, cancel.clone()))),
        None => tracing::error!(topic = %Topic::DeferredScans, "Work queue already claimed, poll worker not started"),
    }

    match (
        bus.take_work_queue(Topic::HighThreat),
        bus.take_work_queue(Topic::MediumThreat),
    ) {
        (Some(high), Some(medium)) => {
            handles.push(tokio::spawn(state.dispatcher.clone().run(high, medium, cancel.clone())));
        }
        _ => tracing::error!("Alert work queues already claimed, dispatcher not started"),
    }

    match &state.digest {
        Some(digest) => handles.push(digest.clone().spawn_schedule(cancel)),
        None => tracing::info!("Weekly digest disabled (no email provider or digest.enabled = false)"),
    }

    handles
}
