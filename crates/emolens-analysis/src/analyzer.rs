//! Seam to the external facial-analysis service.
//!
//! The model itself lives outside this process. Anything that can turn image
//! bytes into per-face regions and raw emotion scores can sit behind
//! [`EmotionAnalyzer`]; production uses [`HttpAnalyzer`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use emolens_types::models::{EmotionScores, Region};

/// Longest slice of an error body kept in [`AnalyzerError::Status`].
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analyzer unreachable: {0}")]
    Transport(String),
    #[error("analyzer returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed analyzer reply: {0}")]
    InvalidResponse(String),
}

/// One face as reported by the analyzer, before normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFace {
    #[serde(default)]
    pub region: Option<Region>,
    #[serde(default)]
    pub emotion: EmotionScores,
}

#[async_trait]
pub trait EmotionAnalyzer: Send + Sync {
    /// Detect faces in an encoded image and score each one.
    async fn analyze(&self, image: Bytes, content_type: &str) -> Result<Vec<RawFace>, AnalyzerError>;
}

/// Talks to an analysis service that accepts the raw image as the request
/// body and replies with one face object or a list of them.
pub struct HttpAnalyzer {
    client: reqwest::Client,
    url: String,
}

impl HttpAnalyzer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AnalyzerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AnalyzerError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl EmotionAnalyzer for HttpAnalyzer {
    async fn analyze(&self, image: Bytes, content_type: &str) -> Result<Vec<RawFace>, AnalyzerError> {
        let size = image.len();
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(image)
            .send()
            .await
            .map_err(|e| AnalyzerError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| AnalyzerError::Transport(e.to_string()))?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            return Err(AnalyzerError::Status {
                status: status.as_u16(),
                body: text.chars().take(MAX_ERROR_BODY).collect(),
            });
        }

        let faces = parse_reply(&body)?;
        debug!(bytes = size, faces = faces.len(), "analyzer reply");
        Ok(faces)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Reply {
    Many(Vec<RawFace>),
    One(RawFace),
}

/// Decode an analyzer reply and reject scores that cannot be normalized.
pub fn parse_reply(body: &[u8]) -> Result<Vec<RawFace>, AnalyzerError> {
    let reply: Reply =
        serde_json::from_slice(body).map_err(|e| AnalyzerError::InvalidResponse(e.to_string()))?;

    let faces = match reply {
        Reply::Many(faces) => faces,
        Reply::One(face) => vec![face],
    };

    for face in &faces {
        if let Some((label, value)) = face
            .emotion
            .iter()
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(AnalyzerError::InvalidResponse(format!(
                "score for '{label}' is {value}"
            )));
        }
    }

    Ok(faces)
}
