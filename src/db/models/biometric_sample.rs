use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassScore {
    pub label: String,
    pub score: f64,
}

/// One classifier reading. Scores are clamped to [0, 1] and sum to at most 1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BiometricSample {
    pub session_id: i64,
    pub timestamp: DateTime<Utc>,
    pub scores: Vec<ClassScore>,
    pub dominant_label: String,
    pub face_confidence: Option<f64>,
    pub age: Option<f64>,
    pub gender: Option<String>,
    pub task_tag: Option<String>,
}

impl BiometricSample {
    pub fn score(&self, label: &str) -> Option<f64> {
        self.scores
            .iter()
            .find(|entry| entry.label == label)
            .map(|entry| entry.score)
    }
}
