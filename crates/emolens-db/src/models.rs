//! Database row types, mapped directly from SQLite rows.
//! Kept separate from the emolens-types wire models.

use chrono::{DateTime, Utc};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct ResultRow {
    pub id: String,
    pub user_id: String,
    /// Stored file name inside the upload directory.
    pub image_path: String,
    pub dominant_emotion: String,
    pub confidence: f64,
    /// JSON object of label → percentage.
    pub emotions: String,
    pub created_at: DateTime<Utc>,
}

/// A result about to be inserted.
pub struct NewResult {
    pub id: String,
    pub dominant_emotion: String,
    pub confidence: f64,
    pub emotions: String,
}
