//! Quota usage rows
//!
//! `try_increment` is the only write path for `used` going up and is a single
//! conditional UPDATE, so concurrent scans for one account cannot jointly
//! overrun the limit.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use vigil_common::{time, Error, Result};

use crate::utils::retry_on_lock;

/// Max time to keep retrying a locked quota write
const QUOTA_LOCK_WAIT_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq)]
pub struct QuotaRecord {
    pub account_id: String,
    pub period: String,
    pub used: i64,
    pub limit: i64,
    pub last_warned_at: Option<DateTime<Utc>>,
}

/// Lazily create the row for an account/period
pub async fn ensure_record(pool: &SqlitePool, account_id: &str, period: &str, limit: i64) -> Result<()> {
    retry_on_lock("quota ensure_record", QUOTA_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO quota_usage (account_id, period, used, quota_limit)
            VALUES (?, ?, 0, ?)
            "#,
        )
        .bind(account_id)
        .bind(period)
        .bind(limit)
        .execute(pool)
        .await?;
        Ok::<_, Error>(())
    })
    .await
}

/// Atomic compare-and-increment
///
/// Returns `Some((used, limit))` after a successful increment, `None` when the
/// row is already at its limit (row left unchanged).
pub async fn try_increment(pool: &SqlitePool, account_id: &str, period: &str) -> Result<Option<(i64, i64)>> {
    retry_on_lock("quota try_increment", QUOTA_LOCK_WAIT_MS, || async {
        let row = sqlx::query(
            r#"
            UPDATE quota_usage
            SET used = used + 1
            WHERE account_id = ? AND period = ? AND used < quota_limit
            RETURNING used, quota_limit
            "#,
        )
        .bind(account_id)
        .bind(period)
        .fetch_optional(pool)
        .await?;

        Ok::<_, Error>(row.map(|r| (r.get::<i64, _>("used"), r.get::<i64, _>("quota_limit"))))
    })
    .await
}

/// Give back one unit (floored at zero)
pub async fn decrement(pool: &SqlitePool, account_id: &str, period: &str) -> Result<()> {
    retry_on_lock("quota decrement", QUOTA_LOCK_WAIT_MS, || async {
        sqlx::query(
            "UPDATE quota_usage SET used = used - 1 WHERE account_id = ? AND period = ? AND used > 0",
        )
        .bind(account_id)
        .bind(period)
        .execute(pool)
        .await?;
        Ok::<_, Error>(())
    })
    .await
}

pub async fn get_usage(pool: &SqlitePool, account_id: &str, period: &str) -> Result<Option<QuotaRecord>> {
    let row = sqlx::query(
        r#"
        SELECT account_id, period, used, quota_limit, last_warned_at
        FROM quota_usage
        WHERE account_id = ? AND period = ?
        "#,
    )
    .bind(account_id)
    .bind(period)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let last_warned_at: Option<String> = row.get("last_warned_at");
            Ok(Some(QuotaRecord {
                account_id: row.get("account_id"),
                period: row.get("period"),
                used: row.get("used"),
                limit: row.get("quota_limit"),
                last_warned_at: last_warned_at.as_deref().map(time::parse_rfc3339).transpose()?,
            }))
        }
        None => Ok(None),
    }
}

/// Stamp `last_warned_at` unless the account was warned after `cutoff`
///
/// Checks every period of the account so the debounce spans day boundaries.
/// Returns `true` when this caller won the right to warn.
pub async fn mark_warned(
    pool: &SqlitePool,
    account_id: &str,
    period: &str,
    now: DateTime<Utc>,
    cutoff: DateTime<Utc>,
) -> Result<bool> {
    retry_on_lock("quota mark_warned", QUOTA_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            UPDATE quota_usage
            SET last_warned_at = ?
            WHERE account_id = ? AND period = ?
              AND NOT EXISTS (
                  SELECT 1 FROM quota_usage
                  WHERE account_id = ? AND last_warned_at IS NOT NULL AND last_warned_at > ?
              )
            "#,
        )
        .bind(time::to_db(now))
        .bind(account_id)
        .bind(period)
        .bind(account_id)
        .bind(time::to_db(cutoff))
        .execute(pool)
        .await?;
        Ok::<_, Error>(result.rows_affected() == 1)
    })
    .await
}
