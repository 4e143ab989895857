use axum::{
    Extension, Json,
    extract::{Path, State, rejection::{JsonRejection, PathRejection}},
};
use tracing::{info, warn};
use uuid::Uuid;

use emolens_db::models::{NewResult, ResultRow};
use emolens_types::api::{
    HistoryEntry, SaveResultRequest, SaveResultResponse, SavedFace, SuccessResponse,
};
use emolens_types::models::EmotionScores;

use crate::auth::AppState;
use crate::error::ApiError;
use crate::middleware::Claims;
use crate::run_blocking;
use crate::storage::is_valid_name;

/// Slack for confidences that drift just past 100 through float rounding.
const CONFIDENCE_EPSILON: f64 = 1e-6;

/// POST /save_result: persist one record per analyzed face of an image the
/// caller uploaded.
pub async fn save_result(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<SaveResultRequest>, JsonRejection>,
) -> Result<Json<SaveResultResponse>, ApiError> {
    let Json(req) = payload?;

    if req.results.is_empty() {
        return Err(ApiError::BadRequest("No results provided".into()));
    }
    if !is_valid_name(&req.image_id) || !state.store.upload_exists(&req.image_id).await {
        return Err(ApiError::BadRequest("Unknown image".into()));
    }

    let records = req
        .results
        .iter()
        .map(to_record)
        .collect::<Result<Vec<_>, ApiError>>()?;
    let saved = records.len();

    let user_id = claims.sub.to_string();
    let db = state.clone();
    let image_id = req.image_id.clone();
    let owner = run_blocking(move || db.db.get_upload_owner(&image_id)).await?;
    if owner.as_deref() != Some(user_id.as_str()) {
        // Foreign images answer like missing ones
        warn!("User {} tried to save results for image {}", claims.username, req.image_id);
        return Err(ApiError::BadRequest("Unknown image".into()));
    }

    let db = state.clone();
    let image_id = req.image_id.clone();
    run_blocking(move || db.db.insert_results(&user_id, &image_id, &records, chrono::Utc::now()))
        .await?;

    info!(user = %claims.username, image = %req.image_id, saved, "Saved results");

    Ok(Json(SaveResultResponse {
        success: true,
        saved,
    }))
}

fn to_record(face: &SavedFace) -> Result<NewResult, ApiError> {
    if face.dominant_emotion.trim().is_empty() {
        return Err(ApiError::BadRequest("dominant_emotion is required".into()));
    }
    if !face.confidence.is_finite()
        || face.confidence < 0.0
        || face.confidence > 100.0 + CONFIDENCE_EPSILON
    {
        return Err(ApiError::BadRequest(format!(
            "confidence must be between 0 and 100, got {}",
            face.confidence
        )));
    }
    if face.emotions.values().any(|v| !v.is_finite()) {
        return Err(ApiError::BadRequest("emotion scores must be finite".into()));
    }

    let emotions =
        serde_json::to_string(&face.emotions).map_err(|e| anyhow::anyhow!("encode emotions: {e}"))?;

    Ok(NewResult {
        id: Uuid::new_v4().to_string(),
        dominant_emotion: face.dominant_emotion.clone(),
        confidence: face.confidence,
        emotions,
    })
}

/// GET /history: the caller's saved results, newest first.
pub async fn history(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let db = state.clone();
    let user_id = claims.sub.to_string();
    let rows = run_blocking(move || db.db.get_results_for_user(&user_id)).await?;

    let entries = rows
        .into_iter()
        .map(|row| history_entry(&state, row))
        .collect::<Result<Vec<_>, ApiError>>()?;

    Ok(Json(entries))
}

fn history_entry(state: &AppState, row: ResultRow) -> Result<HistoryEntry, ApiError> {
    let id: Uuid = row
        .id
        .parse()
        .map_err(|e| anyhow::anyhow!("result id {} is not a UUID: {e}", row.id))?;

    let emotions: EmotionScores = serde_json::from_str(&row.emotions).unwrap_or_else(|e| {
        warn!("Result {} has unreadable emotions: {}", row.id, e);
        EmotionScores::new()
    });

    let local_time = row
        .created_at
        .with_timezone(&state.display_offset)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string();

    Ok(HistoryEntry {
        id,
        result_image_url: format!("/results/{}", row.image_path),
        image_id: row.image_path,
        dominant_emotion: row.dominant_emotion,
        confidence: row.confidence,
        emotions,
        created_at: row.created_at,
        local_time,
    })
}

/// DELETE /history/{result_id} (also POST /delete_result/{result_id}).
///
/// Image files go once no saved result references them any more. File removal
/// is best-effort: the record is already gone if it fails.
pub async fn delete_result(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let Path(result_id) = path?;
    let id = result_id.to_string();
    let user_id = claims.sub.to_string();

    let db = state.clone();
    let lookup = id.clone();
    let row = run_blocking(move || db.db.get_result(&lookup))
        .await?
        .ok_or(ApiError::NotFound)?;

    if row.user_id != user_id {
        warn!("User {} tried to delete result {} owned by someone else", claims.username, id);
        return Err(ApiError::Forbidden);
    }

    let db = state.clone();
    let (image_path, remaining) = run_blocking(move || db.db.delete_result(&id, &user_id))
        .await?
        .ok_or(ApiError::NotFound)?;

    if remaining == 0 {
        if let Err(e) = state.store.delete_image(&image_path).await {
            warn!("Failed to delete image files for {}: {:#}", image_path, e);
        }
    }

    info!(user = %claims.username, result = %result_id, "Deleted result");
    Ok(Json(SuccessResponse { success: true }))
}
