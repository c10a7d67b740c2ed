use crate::pending::DetectionId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

pub use ponto_frame::Rect;

/// Dense integer label assigned to an identity by one training pass.
pub type Label = u32;

/// Bidirectional mapping between enrollment keys and classifier labels.
///
/// Labels are only meaningful for the model trained alongside this map;
/// they are never persisted.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    identities: Vec<String>,
    labels: HashMap<String, Label>,
}

impl IdentityMap {
    /// Assign labels 0, 1, 2, ... in iteration order.
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        let mut map = Self::default();
        for key in keys {
            if map.labels.contains_key(&key) {
                continue;
            }
            map.labels.insert(key.clone(), map.identities.len() as Label);
            map.identities.push(key);
        }
        map
    }

    pub fn identity(&self, label: Label) -> Option<&str> {
        self.identities.get(label as usize).map(String::as_str)
    }

    pub fn label(&self, identity: &str) -> Option<Label> {
        self.labels.get(identity).copied()
    }

    /// Identity keys in label order.
    pub fn identities(&self) -> &[String] {
        &self.identities
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// Raw classifier output: nearest label and its dissimilarity (lower = closer).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub label: Label,
    pub distance: f64,
}

/// Accept a prediction iff `distance <= threshold` and the label is mapped.
pub fn recognize(map: &IdentityMap, prediction: Prediction, threshold: f64) -> Option<&str> {
    if prediction.distance > threshold {
        return None;
    }
    map.identity(prediction.label)
}

/// Outcome for one detected face.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// No model installed; every face is unknown.
    Untrained,
    Unknown {
        label: Option<Label>,
        distance: Option<f64>,
    },
    Recognized { identity: String, distance: f64 },
}

impl Verdict {
    pub fn identity(&self) -> Option<&str> {
        match self {
            Verdict::Recognized { identity, .. } => Some(identity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceReport {
    pub bbox: Rect,
    #[serde(flatten)]
    pub verdict: Verdict,
}

/// Lightweight "a match was just confirmed" record for polling collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionNotice {
    pub detection_id: DetectionId,
    pub identity: String,
    /// Best (lowest) dissimilarity seen during the stable session.
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub bbox: Rect,
}

/// Read-only diagnostic for the largest face in a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DebugPrediction {
    NoFace,
    Untrained {
        bbox: Rect,
    },
    Predicted {
        bbox: Rect,
        label: Label,
        identity: Option<String>,
        confidence: f64,
        threshold: f64,
        recognized: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> IdentityMap {
        IdentityMap::new(["alice".to_string(), "bob".to_string()])
    }

    #[test]
    fn test_identity_map_dense_labels() {
        let m = map();
        assert_eq!(m.len(), 2);
        assert_eq!(m.label("alice"), Some(0));
        assert_eq!(m.label("bob"), Some(1));
        assert_eq!(m.identity(1), Some("bob"));
        assert_eq!(m.identity(2), None);
    }

    #[test]
    fn test_identity_map_ignores_duplicates() {
        let m = IdentityMap::new(["a", "b", "a"].map(String::from));
        assert_eq!(m.identities(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_recognize_at_threshold() {
        let p = Prediction { label: 0, distance: 85.0 };
        assert_eq!(recognize(&map(), p, 85.0), Some("alice"));
        assert_eq!(recognize(&map(), p, 84.9), None);
    }

    #[test]
    fn test_recognize_unmapped_label() {
        // A label outside the map (stale model) is never accepted.
        let p = Prediction { label: 7, distance: 0.0 };
        assert_eq!(recognize(&map(), p, 150.0), None);
    }

    #[test]
    fn test_recognize_threshold_monotonic() {
        let p = Prediction { label: 1, distance: 62.5 };
        let mut accepted = false;
        for t in (30..=150).map(|t| t as f64) {
            let now = recognize(&map(), p, t).is_some();
            // Once accepted, a higher threshold never rejects.
            assert!(!(accepted && !now), "rejected at {t} after accepting lower");
            assert_eq!(now, t >= p.distance);
            accepted = now;
        }
    }

    #[test]
    fn test_verdict_serializes_flat() {
        let report = FaceReport {
            bbox: Rect::new(1, 2, 3, 4),
            verdict: Verdict::Recognized { identity: "alice".into(), distance: 12.0 },
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["verdict"], "recognized");
        assert_eq!(json["identity"], "alice");
        assert_eq!(json["bbox"]["width"], 3);
    }
}
