//! Threat location journal
//!
//! Append-only per subject; the core never truncates it (bulk deletion is an
//! external collaborator concern).

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;
use vigil_common::{time, GeoPoint, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct LocationEntry {
    pub scan_id: Uuid,
    pub location: GeoPoint,
    pub recorded_at: DateTime<Utc>,
}

/// Append one sighting and bump the subject's last_seen_at
pub async fn append_location(
    pool: &SqlitePool,
    subject_id: &str,
    scan_id: Uuid,
    location: GeoPoint,
    recorded_at: DateTime<Utc>,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO threat_locations (subject_id, scan_id, lat, lon, recorded_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(subject_id)
    .bind(scan_id.to_string())
    .bind(location.lat)
    .bind(location.lon)
    .bind(time::to_db(recorded_at))
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO threat_subjects (subject_id, last_seen_at) VALUES (?, ?)
        ON CONFLICT(subject_id) DO UPDATE SET
            last_seen_at = MAX(threat_subjects.last_seen_at, excluded.last_seen_at)
        "#,
    )
    .bind(subject_id)
    .bind(time::to_db(recorded_at))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Full history for a subject, oldest first
pub async fn list_locations(pool: &SqlitePool, subject_id: &str) -> Result<Vec<LocationEntry>> {
    let rows: Vec<(String, f64, f64, String)> = sqlx::query_as(
        "SELECT scan_id, lat, lon, recorded_at FROM threat_locations WHERE subject_id = ? ORDER BY id",
    )
    .bind(subject_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|(scan_id, lat, lon, recorded_at)| {
            Ok(LocationEntry {
                scan_id: Uuid::parse_str(&scan_id)
                    .map_err(|e| vigil_common::Error::CorruptRecord(e.to_string()))?,
                location: GeoPoint { lat, lon },
                recorded_at: time::parse_rfc3339(&recorded_at)?,
            })
        })
        .collect()
}

pub async fn last_seen(pool: &SqlitePool, subject_id: &str) -> Result<Option<DateTime<Utc>>> {
    let value: Option<String> =
        sqlx::query_scalar("SELECT last_seen_at FROM threat_subjects WHERE subject_id = ?")
            .bind(subject_id)
            .fetch_optional(pool)
            .await?;
    value.as_deref().map(time::parse_rfc3339).transpose()
}
