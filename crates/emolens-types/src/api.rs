use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{EmotionScores, FaceEmotion};

// -- JWT Claims --

/// Session claims carried in the cookie or bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub confirm_password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub username: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Analysis --

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub results: Vec<FaceEmotion>,
    pub result_image_url: String,
    /// Stored name of the upload; pass it back to `/save_result`.
    pub image_id: String,
}

#[derive(Debug, Serialize)]
pub struct RealtimeResponse {
    pub results: Vec<FaceEmotion>,
}

// -- Results --

/// Clients usually post back the whole analysis response, so unknown fields
/// (region, result_image_url) are accepted and ignored.
#[derive(Debug, Deserialize)]
pub struct SaveResultRequest {
    pub image_id: String,
    pub results: Vec<SavedFace>,
}

#[derive(Debug, Deserialize)]
pub struct SavedFace {
    pub dominant_emotion: String,
    pub confidence: f64,
    pub emotions: EmotionScores,
}

#[derive(Debug, Serialize)]
pub struct SaveResultResponse {
    pub success: bool,
    pub saved: usize,
}

#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub image_id: String,
    pub result_image_url: String,
    pub dominant_emotion: String,
    pub confidence: f64,
    pub emotions: EmotionScores,
    pub created_at: DateTime<Utc>,
    /// `created_at` rendered in the server's display offset.
    pub local_time: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}
