pub mod analyzer;
pub mod annotate;
pub mod emotion;

pub use analyzer::{AnalyzerError, EmotionAnalyzer, HttpAnalyzer, RawFace};
pub use emotion::{Precision, dominant_emotion, normalize_emotions, summarize_face};
