use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Emotion label → score. Ordered so that serialization and tie-breaking are
/// deterministic.
pub type EmotionScores = BTreeMap<String, f64>;

/// Face bounding box in image pixel coordinates, as reported by the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// Normalized emotion summary for one detected face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceEmotion {
    pub region: Region,
    pub dominant_emotion: String,
    /// Normalized score of the dominant emotion, in percent.
    pub confidence: f64,
    /// Normalized scores, summing to 100 unless every raw score was zero.
    pub emotions: EmotionScores,
}
