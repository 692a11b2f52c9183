//! Poll Worker
//!
//! Owns deferred scans from `DEFERRED` to a terminal state. Each deferred
//! scan is polled on its own task; one failing job never stalls the others
//! or the consumer loop. There is no outer retry: a timed-out or failed job
//! stays that way.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vigil_common::config::ResolverConfig;
use vigil_common::{EventBus, ThreatEvent};

use crate::db;
use crate::error::{ScanError, ScanResult};
use crate::models::{Scan, ScanState};
use crate::services::resolution_client::{ResolutionError, Resolver};
use crate::services::scan_orchestrator::{advance, alert_for, complete_scan};
use crate::services::threshold_resolver::ThresholdResolver;

#[derive(Clone)]
pub struct PollWorker {
    db: SqlitePool,
    event_bus: EventBus,
    resolver: Arc<dyn Resolver>,
    thresholds: ThresholdResolver,
    deadline: Duration,
    initial_delay: Duration,
}

impl PollWorker {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        resolver: Arc<dyn Resolver>,
        thresholds: ThresholdResolver,
        config: &ResolverConfig,
    ) -> Self {
        Self {
            db,
            event_bus,
            resolver,
            thresholds,
            deadline: Duration::from_secs(config.poll_deadline_secs),
            initial_delay: Duration::from_millis(config.poll_initial_delay_ms),
        }
    }

    /// Drive one deferred scan to a terminal state
    ///
    /// Returns the terminal scan record.
    pub async fn process(&self, scan_id: Uuid, job_id: &str) -> ScanResult<Scan> {
        let mut scan = db::scans::load_scan(&self.db, scan_id)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("scan {}", scan_id)))?;

        if scan.state != ScanState::Deferred {
            return Err(ScanError::InvalidTransition(format!(
                "scan {} is {}, expected {}",
                scan_id,
                scan.state,
                ScanState::Deferred
            )));
        }

        tracing::debug!(scan_id = %scan_id, job_id, "Polling deferred scan");

        match self
            .resolver
            .poll_until_complete(job_id, self.deadline, self.initial_delay)
            .await
        {
            Ok(result) => {
                complete_scan(&self.db, &self.thresholds, &mut scan, &result.matches, result.view_url).await?;

                tracing::info!(
                    scan_id = %scan_id,
                    score = ?scan.top_score,
                    tier = ?scan.match_tier,
                    "Deferred scan completed"
                );
                if let Some(alert) = alert_for(&scan) {
                    self.event_bus.publish(ThreatEvent::AlertRaised { alert });
                }
            }
            Err(ResolutionError::PollTimeout) => {
                scan.failure_reason = Some("polling deadline exceeded".into());
                advance(&self.db, &mut scan, ScanState::TimedOut).await?;
                tracing::warn!(scan_id = %scan_id, job_id, "Deferred scan timed out");
            }
            Err(e) => {
                scan.failure_reason = Some(e.to_string());
                advance(&self.db, &mut scan, ScanState::Failed).await?;
                tracing::warn!(scan_id = %scan_id, job_id, error = %e, "Deferred scan failed");
            }
        }

        Ok(scan)
    }

    /// Consume the deferred-scans work queue until cancelled
    pub async fn run(self, mut rx: mpsc::Receiver<ThreatEvent>, cancel: CancellationToken) {
        tracing::info!("Poll worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(event @ ThreatEvent::ScanDeferred { .. }) => self.spawn_job(event, cancel.clone()),
                    Some(_) => {}
                    None => break,
                },
            }
        }
        tracing::info!("Poll worker stopped");
    }

    fn spawn_job(&self, event: ThreatEvent, cancel: CancellationToken) {
        let ThreatEvent::ScanDeferred { scan_id, ref job_id, .. } = event else {
            return;
        };
        let job_id = job_id.clone();
        let worker = self.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(scan_id = %scan_id, "Shutdown while polling, scan left DEFERRED");
                }
                outcome = worker.process(scan_id, &job_id) => {
                    if let Err(e) = outcome {
                        tracing::error!(scan_id = %scan_id, error = %e, "Poll job failed");
                        worker.event_bus.dead_letter(event, e.to_string());
                    }
                }
            }
        });
    }
}
