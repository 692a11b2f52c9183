//! Scan record persistence
//!
//! State changes are compare-and-set on the previous state, so a scan can
//! never regress or leave a terminal state even under concurrent writers.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;
use vigil_common::{time, Error, GeoPoint, Result, Tier};

use crate::models::{FeatureValue, Scan, ScanState};

const SCAN_COLUMNS: &str = r#"
    scan_id, account_id, service_id, external_job_id, state, top_score,
    match_tier, view_url, polling_required, credential_ref, subject_id,
    features, site_id, site_lat, site_lon, failure_reason, created_at, updated_at
"#;

/// Insert a freshly admitted scan
pub async fn insert_scan(pool: &SqlitePool, scan: &Scan) -> Result<()> {
    let features = serde_json::to_string(&scan.features)?;

    sqlx::query(
        r#"
        INSERT INTO scans (
            scan_id, account_id, service_id, external_job_id, state, top_score,
            match_tier, view_url, polling_required, credential_ref, subject_id,
            features, site_id, site_lat, site_lon, failure_reason, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(scan.scan_id.to_string())
    .bind(&scan.account_id)
    .bind(&scan.service_id)
    .bind(&scan.external_job_id)
    .bind(scan.state.as_str())
    .bind(scan.top_score)
    .bind(scan.match_tier.map(|t| t.as_str()))
    .bind(&scan.view_url)
    .bind(scan.polling_required)
    .bind(&scan.credential_ref)
    .bind(&scan.subject_id)
    .bind(features)
    .bind(&scan.site_id)
    .bind(scan.location.map(|p| p.lat))
    .bind(scan.location.map(|p| p.lon))
    .bind(&scan.failure_reason)
    .bind(time::to_db(scan.created_at))
    .bind(time::to_db(scan.updated_at))
    .execute(pool)
    .await?;

    Ok(())
}

/// Persist `scan` if the stored state still equals `expected`
///
/// Returns `false` when another writer moved the scan first (or it is
/// already terminal); nothing is written in that case.
pub async fn save_transition(pool: &SqlitePool, scan: &Scan, expected: ScanState) -> Result<bool> {
    let features = serde_json::to_string(&scan.features)?;

    let result = sqlx::query(
        r#"
        UPDATE scans SET
            external_job_id = ?,
            state = ?,
            top_score = ?,
            match_tier = ?,
            view_url = ?,
            polling_required = ?,
            credential_ref = ?,
            subject_id = ?,
            features = ?,
            failure_reason = ?,
            updated_at = ?
        WHERE scan_id = ?
          AND state = ?
          AND state NOT IN ('COMPLETED', 'FAILED', 'TIMED_OUT')
        "#,
    )
    .bind(&scan.external_job_id)
    .bind(scan.state.as_str())
    .bind(scan.top_score)
    .bind(scan.match_tier.map(|t| t.as_str()))
    .bind(&scan.view_url)
    .bind(scan.polling_required)
    .bind(&scan.credential_ref)
    .bind(&scan.subject_id)
    .bind(features)
    .bind(&scan.failure_reason)
    .bind(time::to_db(scan.updated_at))
    .bind(scan.scan_id.to_string())
    .bind(expected.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn load_scan(pool: &SqlitePool, scan_id: Uuid) -> Result<Option<Scan>> {
    let query = format!("SELECT {} FROM scans WHERE scan_id = ?", SCAN_COLUMNS);
    let row = sqlx::query(&query)
        .bind(scan_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|r| row_to_scan(&r)).transpose()
}

/// Completed scans with a score, updated in `[since, until]`
pub async fn list_completed_between(
    pool: &SqlitePool,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<Scan>> {
    let query = format!(
        r#"
        SELECT {} FROM scans
        WHERE state = 'COMPLETED'
          AND top_score IS NOT NULL
          AND updated_at >= ?
          AND updated_at <= ?
        ORDER BY account_id, updated_at
        "#,
        SCAN_COLUMNS
    );

    let rows = sqlx::query(&query)
        .bind(time::to_db(since))
        .bind(time::to_db(until))
        .fetch_all(pool)
        .await?;

    // One unreadable row must not hide every other account's scans
    let mut scans = Vec::with_capacity(rows.len());
    for row in &rows {
        match row_to_scan(row) {
            Ok(scan) => scans.push(scan),
            Err(e) => {
                let scan_id: String = row.try_get("scan_id").unwrap_or_default();
                tracing::warn!(scan_id = %scan_id, error = %e, "Skipping unreadable scan row");
            }
        }
    }
    Ok(scans)
}

fn row_to_scan(row: &SqliteRow) -> Result<Scan> {
    let scan_id: String = row.get("scan_id");
    let scan_id = Uuid::parse_str(&scan_id)
        .map_err(|e| Error::CorruptRecord(format!("scan_id '{}': {}", scan_id, e)))?;

    let state: String = row.get("state");
    let state = state.parse::<ScanState>().map_err(Error::CorruptRecord)?;

    let match_tier: Option<String> = row.get("match_tier");
    let match_tier = match_tier
        .map(|t| t.parse::<Tier>())
        .transpose()
        .map_err(Error::CorruptRecord)?;

    let features: String = row.get("features");
    let features: Vec<FeatureValue> = serde_json::from_str(&features)?;

    let site_lat: Option<f64> = row.get("site_lat");
    let site_lon: Option<f64> = row.get("site_lon");
    let location = match (site_lat, site_lon) {
        (Some(lat), Some(lon)) => Some(GeoPoint { lat, lon }),
        _ => None,
    };

    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Scan {
        scan_id,
        account_id: row.get("account_id"),
        service_id: row.get("service_id"),
        external_job_id: row.get("external_job_id"),
        state,
        top_score: row.get("top_score"),
        match_tier,
        view_url: row.get("view_url"),
        polling_required: row.get("polling_required"),
        credential_ref: row.get("credential_ref"),
        subject_id: row.get("subject_id"),
        features,
        site_id: row.get("site_id"),
        location,
        failure_reason: row.get("failure_reason"),
        created_at: time::parse_rfc3339(&created_at)?,
        updated_at: time::parse_rfc3339(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_pool;

    #[tokio::test]
    async fn test_insert_and_load() {
        let (_dir, pool) = test_pool().await;
        let mut scan = Scan::new("acct-1".into(), Some("svc".into()));
        scan.location = Some(GeoPoint { lat: 40.0, lon: -73.5 });
        insert_scan(&pool, &scan).await.unwrap();

        let loaded = load_scan(&pool, scan.scan_id).await.unwrap().unwrap();
        assert_eq!(loaded.account_id, "acct-1");
        assert_eq!(loaded.service_id.as_deref(), Some("svc"));
        assert_eq!(loaded.state, ScanState::Created);
        assert_eq!(loaded.location, scan.location);
        assert!(!loaded.polling_required);
    }

    #[tokio::test]
    async fn test_save_transition_is_compare_and_set() {
        let (_dir, pool) = test_pool().await;
        let mut scan = Scan::new("acct-1".into(), None);
        insert_scan(&pool, &scan).await.unwrap();

        scan.transition_to(ScanState::Submitted).unwrap();
        assert!(save_transition(&pool, &scan, ScanState::Created).await.unwrap());

        // Stale writer still believing the scan is CREATED loses
        assert!(!save_transition(&pool, &scan, ScanState::Created).await.unwrap());
    }

    #[tokio::test]
    async fn test_unreadable_rows_are_skipped_in_listing() {
        let (_dir, pool) = test_pool().await;
        let mut ids = Vec::new();
        for account in ["acct-ok", "acct-bad"] {
            let mut scan = Scan::new(account.into(), None);
            scan.state = ScanState::Completed;
            scan.top_score = Some(60.0);
            insert_scan(&pool, &scan).await.unwrap();
            ids.push(scan.scan_id);
        }
        sqlx::query("UPDATE scans SET features = 'not-json' WHERE account_id = 'acct-bad'")
            .execute(&pool)
            .await
            .unwrap();

        let now = Utc::now();
        let listed = list_completed_between(&pool, now - chrono::Duration::hours(1), now)
            .await
            .unwrap();

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].scan_id, ids[0]);
    }

    #[tokio::test]
    async fn test_terminal_rows_are_never_rewritten() {
        let (_dir, pool) = test_pool().await;
        let mut scan = Scan::new("acct-1".into(), None);
        insert_scan(&pool, &scan).await.unwrap();
        scan.transition_to(ScanState::Failed).unwrap();
        assert!(save_transition(&pool, &scan, ScanState::Created).await.unwrap());

        // Even a caller claiming the terminal state as "expected" cannot rewrite it
        scan.failure_reason = Some("overwrite".into());
        assert!(!save_transition(&pool, &scan, ScanState::Failed).await.unwrap());

        let loaded = load_scan(&pool, scan.scan_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, ScanState::Failed);
        assert!(loaded.failure_reason.is_none());
    }
}
