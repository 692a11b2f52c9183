//! Database and configuration fixtures

use anyhow::Result;
use sqlx::SqlitePool;
use tempfile::TempDir;
use vigil_common::config::TomlConfig;
use vigil_scan::db;
use vigil_scan::db::profiles::AccountProfile;

/// Create temporary test database with the schema applied
///
/// Returns (TempDir, SqlitePool) - TempDir must be kept alive for duration of test
pub async fn create_test_db() -> Result<(TempDir, SqlitePool)> {
    let temp_dir = TempDir::new()?;
    let pool = db::init_database_pool(&temp_dir.path().join("test_vigil.db")).await?;
    Ok((temp_dir, pool))
}

/// Config tuned for fast tests against a stub resolver at `resolver_base`
pub fn test_config(resolver_base: &str) -> TomlConfig {
    let mut config = TomlConfig::default();
    config.resolver.base_url = resolver_base.to_string();
    config.resolver.api_key = Some("test-key".to_string());
    config.resolver.submit_timeout_ms = 2_000;
    config.resolver.submit_wait_ms = 300;
    config.resolver.max_retries = 2;
    config.resolver.retry_base_delay_ms = 5;
    config.resolver.requests_per_second = 1_000;
    config.resolver.poll_deadline_secs = 5;
    config.resolver.poll_initial_delay_ms = 10;
    config.resolver.poll_max_delay_ms = 50;
    config.alerts.webhook_timeout_ms = 500;
    config.digest.retry_base_delay_ms = 1;
    config.digest.unsubscribe_base_url = "https://vigil.test/unsubscribe".to_string();
    config
}

/// Account with phone, email, one device token and one webhook subscription
pub async fn seed_contactable_account(pool: &SqlitePool, account_id: &str) -> Result<()> {
    db::profiles::upsert_profile(
        pool,
        &AccountProfile {
            account_id: account_id.to_string(),
            email: Some(format!("{}@example.com", account_id)),
            phone: Some("+15550100".to_string()),
            ..Default::default()
        },
    )
    .await?;
    db::consent::set_consent(pool, account_id, true).await?;
    db::devices::register_token(pool, account_id, &format!("device-{}", account_id)).await?;
    db::webhooks::add_subscription(pool, account_id, "https://hooks.example.com/vigil").await?;
    Ok(())
}
