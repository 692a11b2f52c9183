//! Account contact profiles
//!
//! Read by the SMS channel and the weekly digest; the digest also writes the
//! opt-out flag (hard bounce) and the lazily provisioned unsubscribe token.

use sqlx::{Row, SqlitePool};
use vigil_common::Result;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountProfile {
    pub account_id: String,
    pub email: Option<String>,
    /// E.164 phone number for SMS alerts
    pub phone: Option<String>,
    pub digest_opt_out: bool,
    pub unsubscribe_token: Option<String>,
}

pub async fn get_profile(pool: &SqlitePool, account_id: &str) -> Result<Option<AccountProfile>> {
    let row = sqlx::query(
        r#"
        SELECT account_id, email, phone, digest_opt_out, unsubscribe_token
        FROM account_profiles
        WHERE account_id = ?
        "#,
    )
    .bind(account_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| AccountProfile {
        account_id: row.get("account_id"),
        email: row.get("email"),
        phone: row.get("phone"),
        digest_opt_out: row.get("digest_opt_out"),
        unsubscribe_token: row.get("unsubscribe_token"),
    }))
}

pub async fn upsert_profile(pool: &SqlitePool, profile: &AccountProfile) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO account_profiles (account_id, email, phone, digest_opt_out, unsubscribe_token)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(account_id) DO UPDATE SET
            email = excluded.email,
            phone = excluded.phone,
            digest_opt_out = excluded.digest_opt_out,
            unsubscribe_token = excluded.unsubscribe_token
        "#,
    )
    .bind(&profile.account_id)
    .bind(&profile.email)
    .bind(&profile.phone)
    .bind(profile.digest_opt_out)
    .bind(&profile.unsubscribe_token)
    .execute(pool)
    .await?;
    Ok(())
}

/// Permanently opt the account out of the digest
pub async fn set_digest_opt_out(pool: &SqlitePool, account_id: &str) -> Result<()> {
    sqlx::query("UPDATE account_profiles SET digest_opt_out = 1 WHERE account_id = ?")
        .bind(account_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Store `candidate` as the unsubscribe token unless one already exists
///
/// Returns the token now on record (the existing one if another run won).
pub async fn ensure_unsubscribe_token(pool: &SqlitePool, account_id: &str, candidate: &str) -> Result<String> {
    sqlx::query(
        "UPDATE account_profiles SET unsubscribe_token = ? WHERE account_id = ? AND unsubscribe_token IS NULL",
    )
    .bind(candidate)
    .bind(account_id)
    .execute(pool)
    .await?;

    let token: Option<String> =
        sqlx::query_scalar("SELECT unsubscribe_token FROM account_profiles WHERE account_id = ?")
            .bind(account_id)
            .fetch_one(pool)
            .await?;

    Ok(token.unwrap_or_else(|| candidate.to_string()))
}
