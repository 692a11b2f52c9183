//! Durable keyed store
//!
//! SQLite tables for scans, quota usage, thresholds and the collaborator
//! records (consent, webhook subscriptions, device tokens, account profiles)
//! read by the core. Raw imagery is never stored.

pub mod consent;
pub mod devices;
pub mod journal;
pub mod profiles;
pub mod quota;
pub mod scans;
pub mod settings;
pub mod thresholds;
pub mod webhooks;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use vigil_common::Result;

/// Initialize database connection pool
///
/// Creates the file (and parent directory) when missing and applies the
/// schema.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create all tables and indexes if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    const SCHEMA: &[&str] = &[
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS scans (
            scan_id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            service_id TEXT,
            external_job_id TEXT,
            state TEXT NOT NULL,
            top_score REAL,
            match_tier TEXT,
            view_url TEXT,
            polling_required INTEGER NOT NULL DEFAULT 0,
            credential_ref TEXT,
            subject_id TEXT,
            features TEXT NOT NULL DEFAULT '[]',
            site_id TEXT,
            site_lat REAL,
            site_lon REAL,
            failure_reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_scans_state_updated ON scans (state, updated_at)",
        "CREATE INDEX IF NOT EXISTS idx_scans_account ON scans (account_id, updated_at)",
        r#"
        CREATE TABLE IF NOT EXISTS quota_usage (
            account_id TEXT NOT NULL,
            period TEXT NOT NULL,
            used INTEGER NOT NULL DEFAULT 0,
            quota_limit INTEGER NOT NULL,
            last_warned_at TEXT,
            PRIMARY KEY (account_id, period),
            CHECK (used >= 0 AND used <= quota_limit)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS thresholds (
            scope TEXT NOT NULL,
            scope_id TEXT NOT NULL,
            high REAL NOT NULL,
            medium REAL NOT NULL,
            low REAL NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (scope, scope_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS consent (
            account_id TEXT PRIMARY KEY,
            allowed INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS webhook_subscriptions (
            subscription_id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            url TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_webhooks_account ON webhook_subscriptions (account_id)",
        r#"
        CREATE TABLE IF NOT EXISTS device_tokens (
            token TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            registered_at TEXT NOT NULL,
            failed_at TEXT,
            failure_reason TEXT
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_device_tokens_account ON device_tokens (account_id)",
        r#"
        CREATE TABLE IF NOT EXISTS account_profiles (
            account_id TEXT PRIMARY KEY,
            email TEXT,
            phone TEXT,
            digest_opt_out INTEGER NOT NULL DEFAULT 0,
            unsubscribe_token TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS threat_subjects (
            subject_id TEXT PRIMARY KEY,
            last_seen_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS threat_locations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_id TEXT NOT NULL,
            scan_id TEXT NOT NULL,
            lat REAL NOT NULL,
            lon REAL NOT NULL,
            recorded_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_threat_locations_subject ON threat_locations (subject_id)",
    ];

    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }

    tracing::info!("Database tables initialized");

    Ok(())
}
