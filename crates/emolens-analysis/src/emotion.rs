use emolens_types::models::{EmotionScores, FaceEmotion};

use crate::analyzer::RawFace;

/// How much precision to keep in the reported confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Full,
    /// Round to the given number of decimal places.
    Rounded(u32),
}

/// Scale scores so they sum to 100. A mapping whose sum is not positive is
/// returned unchanged.
pub fn normalize_emotions(scores: &EmotionScores) -> EmotionScores {
    // Scale by the largest score first so huge inputs cannot overflow the sum.
    let max = scores.values().copied().fold(0.0, f64::max);
    if max <= 0.0 {
        return scores.clone();
    }

    let total: f64 = scores.values().map(|value| value / max).sum();
    if total > 0.0 {
        scores
            .iter()
            .map(|(label, value)| (label.clone(), value / max / total * 100.0))
            .collect()
    } else {
        scores.clone()
    }
}

/// Label with the highest score. On ties the first label in map order wins.
pub fn dominant_emotion(scores: &EmotionScores) -> Option<(&str, f64)> {
    let mut best: Option<(&str, f64)> = None;
    for (label, &value) in scores {
        match best {
            Some((_, top)) if value <= top => {}
            _ => best = Some((label.as_str(), value)),
        }
    }
    best
}

/// Build the per-face summary. Faces without a region or without any scores
/// carry nothing to report and yield `None`.
pub fn summarize_face(face: &RawFace, precision: Precision) -> Option<FaceEmotion> {
    let region = face.region?;
    let emotions = normalize_emotions(&face.emotion);
    let (label, confidence) = dominant_emotion(&emotions)?;

    let confidence = match precision {
        Precision::Full => confidence,
        Precision::Rounded(places) => round_to(confidence, places),
    };

    Some(FaceEmotion {
        region,
        dominant_emotion: label.to_string(),
        confidence,
        emotions,
    })
}

fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use emolens_types::models::Region;

    fn scores(pairs: &[(&str, f64)]) -> EmotionScores {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn normalized_scores_sum_to_hundred() {
        let inputs = [
            scores(&[("happy", 0.7), ("sad", 0.2), ("neutral", 0.1)]),
            scores(&[("angry", 12.5), ("fear", 3.0), ("surprise", 900.0)]),
            scores(&[("happy", 1e-9)]),
            scores(&[("disgust", 0.0), ("happy", 42.0), ("sad", 0.0)]),
        ];

        for input in &inputs {
            let total: f64 = normalize_emotions(input).values().sum();
            assert!((total - 100.0).abs() < 1e-9, "sum was {total}");
        }
    }

    #[test]
    fn huge_scores_still_sum_to_hundred() {
        let out = normalize_emotions(&scores(&[("happy", 1e308), ("sad", 1e308), ("fear", 0.0)]));
        assert!((out["happy"] - 50.0).abs() < 1e-9);
        assert!((out["sad"] - 50.0).abs() < 1e-9);
        assert_eq!(out["fear"], 0.0);
    }

    #[test]
    fn normalization_preserves_proportions() {
        let out = normalize_emotions(&scores(&[("happy", 3.0), ("sad", 1.0)]));
        assert!((out["happy"] - 75.0).abs() < 1e-9);
        assert!((out["sad"] - 25.0).abs() < 1e-9);
    }

    #[test]
    fn zero_sum_is_returned_unchanged() {
        let input = scores(&[("happy", 0.0), ("sad", 0.0)]);
        assert_eq!(normalize_emotions(&input), input);

        let empty = EmotionScores::new();
        assert!(normalize_emotions(&empty).is_empty());
    }

    #[test]
    fn dominant_picks_maximum() {
        let s = scores(&[("angry", 10.0), ("happy", 70.0), ("sad", 20.0)]);
        assert_eq!(dominant_emotion(&s), Some(("happy", 70.0)));
    }

    #[test]
    fn dominant_tie_prefers_first_label() {
        let s = scores(&[("sad", 50.0), ("happy", 50.0)]);
        assert_eq!(dominant_emotion(&s), Some(("happy", 50.0)));

        let zeros = scores(&[("neutral", 0.0), ("angry", 0.0)]);
        assert_eq!(dominant_emotion(&zeros), Some(("angry", 0.0)));
    }

    #[test]
    fn dominant_of_empty_is_none() {
        assert_eq!(dominant_emotion(&EmotionScores::new()), None);
    }

    #[test]
    fn summarize_reports_normalized_confidence() {
        let face = RawFace {
            region: Some(Region { x: 1, y: 2, w: 30, h: 40 }),
            emotion: scores(&[("happy", 2.0), ("neutral", 1.0)]),
        };

        let full = summarize_face(&face, Precision::Full).unwrap();
        assert_eq!(full.dominant_emotion, "happy");
        assert!((full.confidence - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(full.region, Region { x: 1, y: 2, w: 30, h: 40 });

        let rounded = summarize_face(&face, Precision::Rounded(2)).unwrap();
        assert_eq!(rounded.confidence, 66.67);
        // Only the headline confidence is rounded.
        assert!((rounded.emotions["neutral"] - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn summarize_skips_faces_without_region_or_scores() {
        let no_region = RawFace {
            region: None,
            emotion: scores(&[("happy", 1.0)]),
        };
        assert!(summarize_face(&no_region, Precision::Full).is_none());

        let no_scores = RawFace {
            region: Some(Region { x: 0, y: 0, w: 10, h: 10 }),
            emotion: EmotionScores::new(),
        };
        assert!(summarize_face(&no_scores, Precision::Full).is_none());
    }
}
