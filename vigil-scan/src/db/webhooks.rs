//! Webhook subscriptions (registered by the webhook-registration collaborator)

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;
use vigil_common::{time, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookSubscription {
    pub subscription_id: Uuid,
    pub account_id: String,
    pub url: String,
    pub enabled: bool,
}

pub async fn list_enabled(pool: &SqlitePool, account_id: &str) -> Result<Vec<WebhookSubscription>> {
    let rows = sqlx::query(
        r#"
        SELECT subscription_id, account_id, url, enabled
        FROM webhook_subscriptions
        WHERE account_id = ? AND enabled = 1
        ORDER BY created_at
        "#,
    )
    .bind(account_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let id: String = row.get("subscription_id");
            match Uuid::parse_str(&id) {
                Ok(subscription_id) => Some(WebhookSubscription {
                    subscription_id,
                    account_id: row.get("account_id"),
                    url: row.get("url"),
                    enabled: row.get("enabled"),
                }),
                Err(e) => {
                    tracing::warn!(subscription_id = %id, error = %e, "Skipping webhook with bad id");
                    None
                }
            }
        })
        .collect())
}

pub async fn add_subscription(pool: &SqlitePool, account_id: &str, url: &str) -> Result<Uuid> {
    let subscription_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO webhook_subscriptions (subscription_id, account_id, url, enabled, created_at)
        VALUES (?, ?, ?, 1, ?)
        "#,
    )
    .bind(subscription_id.to_string())
    .bind(account_id)
    .bind(url)
    .bind(time::to_db(Utc::now()))
    .execute(pool)
    .await?;
    Ok(subscription_id)
}
