use axum::{
    Json,
    extract::rejection::{JsonRejection, PathRejection},
    extract::multipart::{MultipartError, MultipartRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use emolens_analysis::AnalyzerError;
use emolens_analysis::annotate::AnnotateError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Invalid username or password")]
    WrongCredentials,

    #[error("Authentication required")]
    Unauthorized,

    #[error("Not allowed to access this result")]
    Forbidden,

    #[error("Result not found")]
    NotFound,

    #[error("A user with this name already exists")]
    UserAlreadyExists,

    #[error("Upload is too large")]
    PayloadTooLarge,

    #[error("Analysis failed")]
    Analysis(#[from] AnalyzerError),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::WrongCredentials | ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::UserAlreadyExists => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Analysis(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Internal(e) => error!("Internal error: {:#}", e),
            ApiError::Analysis(e) => error!("Analyzer error: {}", e),
            _ => {}
        }

        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
        }));

        (self.status(), body).into_response()
    }
}

impl From<AnnotateError> for ApiError {
    fn from(err: AnnotateError) -> Self {
        match err {
            AnnotateError::UnsupportedFormat => {
                ApiError::BadRequest("Unsupported image format; use JPEG, PNG, WebP or BMP".into())
            }
            AnnotateError::Decode(e) => {
                warn!("Rejected undecodable upload: {}", e);
                ApiError::BadRequest("Could not decode image".into())
            }
            AnnotateError::Encode(e) => ApiError::Internal(anyhow::anyhow!("annotate encode: {e}")),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge
        } else {
            ApiError::BadRequest(err.body_text())
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}
