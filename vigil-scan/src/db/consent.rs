//! Consent records (written by the consent-toggle collaborator)

use chrono::Utc;
use sqlx::SqlitePool;
use vigil_common::{time, Result};

/// Stored consent flag; `None` when the account never recorded a choice
pub async fn get_consent(pool: &SqlitePool, account_id: &str) -> Result<Option<bool>> {
    let allowed: Option<bool> = sqlx::query_scalar("SELECT allowed FROM consent WHERE account_id = ?")
        .bind(account_id)
        .fetch_optional(pool)
        .await?;
    Ok(allowed)
}

pub async fn set_consent(pool: &SqlitePool, account_id: &str, allowed: bool) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO consent (account_id, allowed, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(account_id) DO UPDATE SET
            allowed = excluded.allowed,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(account_id)
    .bind(allowed)
    .bind(time::to_db(Utc::now()))
    .execute(pool)
    .await?;
    Ok(())
}
