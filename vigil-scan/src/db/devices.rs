//! Push device tokens
//!
//! Tokens rejected by the push provider are flagged (`failed_at`) rather than
//! deleted; pruning is left to the device-registration collaborator.

use chrono::Utc;
use sqlx::SqlitePool;
use vigil_common::{time, Result};

/// Tokens for an account that have not been flagged as failed
pub async fn list_active_tokens(pool: &SqlitePool, account_id: &str) -> Result<Vec<String>> {
    let tokens: Vec<String> = sqlx::query_scalar(
        "SELECT token FROM device_tokens WHERE account_id = ? AND failed_at IS NULL ORDER BY registered_at",
    )
    .bind(account_id)
    .fetch_all(pool)
    .await?;
    Ok(tokens)
}

pub async fn register_token(pool: &SqlitePool, account_id: &str, token: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO device_tokens (token, account_id, registered_at) VALUES (?, ?, ?)
        ON CONFLICT(token) DO UPDATE SET
            account_id = excluded.account_id,
            failed_at = NULL,
            failure_reason = NULL
        "#,
    )
    .bind(token)
    .bind(account_id)
    .bind(time::to_db(Utc::now()))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_failed(pool: &SqlitePool, token: &str, reason: &str) -> Result<()> {
    sqlx::query("UPDATE device_tokens SET failed_at = ?, failure_reason = ? WHERE token = ?")
        .bind(time::to_db(Utc::now()))
        .bind(reason)
        .bind(token)
        .execute(pool)
        .await?;
    Ok(())
}

/// Tokens flagged for pruning, with the recorded reason
pub async fn list_failed_tokens(pool: &SqlitePool, account_id: &str) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, Option<String>)> = sqlx::query_as(
        "SELECT token, failure_reason FROM device_tokens WHERE account_id = ? AND failed_at IS NOT NULL",
    )
    .bind(account_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(token, reason)| (token, reason.unwrap_or_default()))
        .collect())
}
