//! Scan submission and lookup
//!
//! POST /scans, GET /scans/:scan_id

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vigil_common::Tier;
use zeroize::Zeroize;

use crate::error::{ApiError, ApiResult};
use crate::models::{ImageInput, Scan, ScanState, SiteMeta};
use crate::services::{ScanOutcome, ScanRequest};
use crate::AppState;

/// POST /scans request
///
/// Exactly one of `image_url` / `image_base64` must be set.
#[derive(Deserialize)]
pub struct SubmitScanRequest {
    pub account_id: String,
    pub service_id: Option<String>,
    pub image_url: Option<String>,
    pub image_base64: Option<String>,
    #[serde(default)]
    pub site: SiteMeta,
}

/// Scan as returned to API callers
#[derive(Debug, Serialize)]
pub struct ScanResponse {
    pub scan_id: Uuid,
    /// `completed`, `pending` or `failed`
    pub status: &'static str,
    pub state: ScanState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_url: Option<String>,
    pub polling_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Scan> for ScanResponse {
    fn from(scan: &Scan) -> Self {
        let status = match scan.state {
            ScanState::Completed => "completed",
            ScanState::Failed | ScanState::TimedOut => "failed",
            _ => "pending",
        };
        Self {
            scan_id: scan.scan_id,
            status,
            state: scan.state,
            score: scan.top_score,
            tier: scan.match_tier,
            subject_id: scan.subject_id.clone(),
            view_url: scan.view_url.clone(),
            polling_required: scan.polling_required,
            failure_reason: scan.failure_reason.clone(),
            created_at: scan.created_at,
            updated_at: scan.updated_at,
        }
    }
}

/// POST /scans
///
/// 200 with the classified scan when the resolver answered immediately,
/// 202 when the scan was deferred for polling.
pub async fn submit_scan(
    State(state): State<AppState>,
    Json(request): Json<SubmitScanRequest>,
) -> ApiResult<(StatusCode, Json<ScanResponse>)> {
    let SubmitScanRequest {
        account_id,
        service_id,
        image_url,
        image_base64,
        site,
    } = request;

    let image = match (image_url, image_base64) {
        (Some(url), None) => ImageInput::Url(url),
        (None, Some(mut encoded)) => {
            let decoded = base64::engine::general_purpose::STANDARD.decode(encoded.trim());
            encoded.zeroize();
            let bytes = decoded.map_err(|_| ApiError::BadRequest("image_base64 is not valid base64".into()))?;
            ImageInput::from_bytes(bytes)
        }
        _ => {
            return Err(ApiError::BadRequest(
                "exactly one of image_url or image_base64 is required".into(),
            ))
        }
    };

    let outcome = state
        .orchestrator
        .submit_scan(ScanRequest {
            account_id,
            service_id,
            image,
            site,
        })
        .await?;

    let status = match outcome {
        ScanOutcome::Completed(_) => StatusCode::OK,
        ScanOutcome::Pending(_) => StatusCode::ACCEPTED,
    };
    Ok((status, Json(ScanResponse::from(outcome.scan()))))
}

/// GET /scans/:scan_id
pub async fn get_scan(
    State(state): State<AppState>,
    Path(scan_id): Path<Uuid>,
) -> ApiResult<Json<ScanResponse>> {
    let scan = state.orchestrator.get_scan(scan_id).await?;
    Ok(Json(ScanResponse::from(&scan)))
}

pub fn scan_routes() -> Router<AppState> {
    Router::new()
        .route("/scans", post(submit_scan))
        .route("/scans/:scan_id", get(get_scan))
}
