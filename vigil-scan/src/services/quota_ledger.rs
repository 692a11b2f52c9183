//! Quota Ledger
//!
//! Per-account, per-UTC-day scan counter. `reserve` is the authoritative
//! admission check (atomic compare-and-increment); `pre_check` is an
//! advisory fast path for rejecting obviously exhausted accounts before any
//! expensive work.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use vigil_common::config::QuotaConfig;
use vigil_common::{time, EventBus, ThreatEvent};

use crate::db;
use crate::error::{ScanError, ScanResult};

/// Minimum spacing between two usage warnings for one account
const WARN_DEBOUNCE_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaReservation {
    pub allowed: bool,
    pub used: i64,
    pub limit: i64,
}

#[derive(Clone)]
pub struct QuotaLedger {
    db: SqlitePool,
    event_bus: EventBus,
    daily_limit: i64,
    warn_percent: i64,
}

impl QuotaLedger {
    pub fn new(db: SqlitePool, event_bus: EventBus, config: &QuotaConfig) -> Self {
        Self {
            db,
            event_bus,
            daily_limit: config.daily_limit,
            warn_percent: config.warn_percent,
        }
    }

    /// Advisory check; only `reserve` is authoritative
    pub async fn pre_check(&self, account_id: &str, period: &str) -> ScanResult<()> {
        if let Some(record) = db::quota::get_usage(&self.db, account_id, period).await? {
            if record.used >= record.limit {
                return Err(ScanError::QuotaExceeded {
                    used: record.used,
                    limit: record.limit,
                });
            }
        }
        Ok(())
    }

    /// Atomically consume one unit of quota
    ///
    /// On rejection the counter is left untouched and `QuotaExceeded` is
    /// returned, so repeated rejected calls are idempotent.
    pub async fn reserve(&self, account_id: &str, period: &str) -> ScanResult<QuotaReservation> {
        db::quota::ensure_record(&self.db, account_id, period, self.daily_limit).await?;

        match db::quota::try_increment(&self.db, account_id, period).await? {
            Some((used, limit)) => {
                tracing::debug!(account_id, period, used, limit, "Quota reserved");
                Ok(QuotaReservation {
                    allowed: true,
                    used,
                    limit,
                })
            }
            None => {
                let record = db::quota::get_usage(&self.db, account_id, period).await?;
                let (used, limit) = record
                    .map(|r| (r.used, r.limit))
                    .unwrap_or((self.daily_limit, self.daily_limit));
                tracing::info!(account_id, period, used, limit, "Quota exceeded");
                Err(ScanError::QuotaExceeded { used, limit })
            }
        }
    }

    /// Return a reservation that was never spent on an external call
    pub async fn release(&self, account_id: &str, period: &str) -> ScanResult<()> {
        db::quota::decrement(&self.db, account_id, period).await?;
        Ok(())
    }

    /// Emit a usage warning once usage crosses the warn ratio, at most once per 24h
    ///
    /// Returns whether a warning was emitted.
    pub async fn warn_if_needed(&self, account_id: &str) -> ScanResult<bool> {
        self.warn_if_needed_at(account_id, Utc::now()).await
    }

    pub(crate) async fn warn_if_needed_at(&self, account_id: &str, now: DateTime<Utc>) -> ScanResult<bool> {
        let period = time::period_key(now);
        let Some(record) = db::quota::get_usage(&self.db, account_id, &period).await? else {
            return Ok(false);
        };

        if record.limit <= 0 || record.used * 100 < record.limit * self.warn_percent {
            return Ok(false);
        }

        let cutoff = now - Duration::hours(WARN_DEBOUNCE_HOURS);
        if !db::quota::mark_warned(&self.db, account_id, &period, now, cutoff).await? {
            return Ok(false);
        }

        tracing::warn!(
            account_id,
            used = record.used,
            limit = record.limit,
            "Account quota usage above warning threshold"
        );
        self.event_bus.publish_lossy(ThreatEvent::QuotaWarning {
            account_id: account_id.to_string(),
            used: record.used,
            limit: record.limit,
            timestamp: now,
        });
        Ok(true)
    }
}
