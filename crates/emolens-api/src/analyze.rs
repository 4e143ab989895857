use axum::{
    Extension, Json,
    extract::{Multipart, State, multipart::MultipartRejection},
};
use bytes::Bytes;
use tracing::{info, warn};

use emolens_analysis::annotate::{self, detect_format};
use emolens_analysis::{Precision, RawFace, summarize_face};
use emolens_types::api::{AnalyzeResponse, RealtimeResponse};
use emolens_types::models::FaceEmotion;

use crate::auth::AppState;
use crate::error::ApiError;
use crate::middleware::Claims;
use crate::run_blocking;
use crate::storage::stored_name;

/// Multipart field carrying the image.
const IMAGE_FIELD: &str = "image";

struct Upload {
    file_name: Option<String>,
    bytes: Bytes,
}

/// POST /analyze: store the upload, analyze it, write an annotated copy.
/// The upload is recorded against the caller, who alone may save results for it.
pub async fn analyze(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let upload = read_image(multipart?).await?;
    let format = detect_format(&upload.bytes)?;

    let extension = format.extensions_str().first().copied().unwrap_or("img");
    let name = stored_name(upload.file_name.as_deref(), extension);
    state.store.save_upload(&name, &upload.bytes).await?;

    let outcome = async {
        let (faces, annotated) = annotate_upload(&state, &upload.bytes, format).await?;
        state.store.save_result(&name, &annotated).await?;

        let db = state.clone();
        let image = name.clone();
        let user_id = claims.sub.to_string();
        run_blocking(move || db.db.record_upload(&image, &user_id, chrono::Utc::now())).await?;
        Ok::<_, ApiError>(faces)
    }
    .await;

    let faces = match outcome {
        Ok(faces) => faces,
        Err(e) => {
            state.store.discard(&name).await;
            return Err(e);
        }
    };

    info!(
        user = %claims.username,
        image = %name,
        faces = faces.len(),
        "Analyzed upload"
    );

    Ok(Json(AnalyzeResponse {
        results: faces,
        result_image_url: format!("/results/{name}"),
        image_id: name,
    }))
}

async fn annotate_upload(
    state: &AppState,
    bytes: &Bytes,
    format: image::ImageFormat,
) -> Result<(Vec<FaceEmotion>, Vec<u8>), ApiError> {
    let raw = state.analyzer.analyze(bytes.clone(), format.to_mime_type()).await?;
    let faces = summarize(&raw, Precision::Full);

    let source = bytes.clone();
    let drawn = faces.clone();
    let annotated = run_blocking(move || Ok(annotate::render(&source, format, &drawn))).await??;

    Ok((faces, annotated))
}

/// POST /analyze_realtime: analyze a webcam frame in memory; nothing is stored.
pub async fn analyze_realtime(
    State(state): State<AppState>,
    Extension(_claims): Extension<Claims>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<RealtimeResponse>, ApiError> {
    let upload = read_image(multipart?).await?;
    let format = detect_format(&upload.bytes)?;

    let raw = state.analyzer.analyze(upload.bytes, format.to_mime_type()).await?;
    if raw.is_empty() {
        return Err(ApiError::BadRequest("No result from analyzer".into()));
    }

    Ok(Json(RealtimeResponse {
        results: summarize(&raw, Precision::Rounded(2)),
    }))
}

fn summarize(raw: &[RawFace], precision: Precision) -> Vec<FaceEmotion> {
    let faces: Vec<FaceEmotion> = raw
        .iter()
        .filter_map(|face| summarize_face(face, precision))
        .collect();

    if faces.len() < raw.len() {
        warn!("Skipped {} faces without region or scores", raw.len() - faces.len());
    }
    faces
}

async fn read_image(mut multipart: Multipart) -> Result<Upload, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        let file_name = field.file_name().map(str::to_string);
        let bytes = field.bytes().await?;
        if bytes.is_empty() {
            return Err(ApiError::BadRequest("Uploaded image is empty".into()));
        }
        return Ok(Upload { file_name, bytes });
    }

    Err(ApiError::BadRequest("No image uploaded".into()))
}
