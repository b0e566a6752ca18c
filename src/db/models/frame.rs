use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Click,
    Scroll,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Click => "click",
            TriggerKind::Scroll => "scroll",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "click" => Some(TriggerKind::Click),
            "scroll" => Some(TriggerKind::Scroll),
            _ => None,
        }
    }
}

/// A persisted display capture.
///
/// `trigger_x`/`trigger_y` are logical canvas coordinates; they must be
/// rescaled by `width / screen_width` (and height likewise) before being
/// drawn onto the image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FrameArtifact {
    pub session_id: i64,
    pub timestamp: DateTime<Utc>,
    pub storage_path: String,
    pub byte_size: u64,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub trigger_kind: Option<TriggerKind>,
    pub trigger_x: Option<f64>,
    pub trigger_y: Option<f64>,
    pub trigger_metadata: serde_json::Value,
    pub task_tag: Option<String>,
}
