use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PointerEventKind {
    Move,
    Click,
    Scroll,
}

impl PointerEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointerEventKind::Move => "move",
            PointerEventKind::Click => "click",
            PointerEventKind::Scroll => "scroll",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "move" => Some(PointerEventKind::Move),
            "click" => Some(PointerEventKind::Click),
            "scroll" => Some(PointerEventKind::Scroll),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PointerButton {
    Left,
    Right,
    Middle,
    Other,
}

impl PointerButton {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointerButton::Left => "left",
            PointerButton::Right => "right",
            PointerButton::Middle => "middle",
            PointerButton::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "left" => PointerButton::Left,
            "right" => PointerButton::Right,
            "middle" => PointerButton::Middle,
            _ => PointerButton::Other,
        }
    }
}

/// One emitted pointer sample. Immutable once created.
///
/// Ordered by timestamp within the producing source only; consumers merging
/// several sources must sort explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PointerEvent {
    pub session_id: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: PointerEventKind,
    pub x: f64,
    pub y: f64,
    pub button: Option<PointerButton>,
    pub pressed: Option<bool>,
    pub scroll_dx: Option<f64>,
    pub scroll_dy: Option<f64>,
    pub task_tag: Option<String>,
}

impl PointerEvent {
    /// True for a button press (not the matching release).
    pub fn is_press(&self) -> bool {
        self.kind == PointerEventKind::Click && self.pressed == Some(true)
    }

    /// Moves and presses contribute to activity maps.
    pub fn is_activity(&self) -> bool {
        self.kind == PointerEventKind::Move || self.is_press()
    }

    pub fn position(&self) -> (f64, f64) {
        (self.x, self.y)
    }
}
