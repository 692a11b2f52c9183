//! Threshold rows keyed by (scope, scope_id)
//!
//! Global config uses scope `global` with scope_id `*`.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use vigil_common::{time, Result};

use crate::models::{ThresholdConfig, ThresholdSource};

pub const GLOBAL_SCOPE_ID: &str = "*";

pub async fn get_threshold(
    pool: &SqlitePool,
    scope: ThresholdSource,
    scope_id: &str,
) -> Result<Option<ThresholdConfig>> {
    let row = sqlx::query("SELECT high, medium, low FROM thresholds WHERE scope = ? AND scope_id = ?")
        .bind(scope.as_str())
        .bind(scope_id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(r) => Ok(Some(ThresholdConfig::new(
            r.try_get("high")?,
            r.try_get("medium")?,
            r.try_get("low")?,
        ))),
        None => Ok(None),
    }
}

/// Upsert; callers validate before writing
pub async fn put_threshold(
    pool: &SqlitePool,
    scope: ThresholdSource,
    scope_id: &str,
    config: &ThresholdConfig,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO thresholds (scope, scope_id, high, medium, low, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(scope, scope_id) DO UPDATE SET
            high = excluded.high,
            medium = excluded.medium,
            low = excluded.low,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(scope.as_str())
    .bind(scope_id)
    .bind(config.high)
    .bind(config.medium)
    .bind(config.low)
    .bind(time::to_db(Utc::now()))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_threshold(pool: &SqlitePool, scope: ThresholdSource, scope_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM thresholds WHERE scope = ? AND scope_id = ?")
        .bind(scope.as_str())
        .bind(scope_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
