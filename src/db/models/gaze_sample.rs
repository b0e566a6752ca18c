use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point in camera-image pixels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PupilPosition {
    pub x: f64,
    pub y: f64,
}

/// Head orientation relative to the camera axis: yaw and pitch are offsets
/// from frame center, depth is the estimator's own z.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HeadPose {
    pub yaw: f64,
    pub pitch: f64,
    pub depth: f64,
}

/// One gaze estimate. `gaze_x`/`gaze_y` are screen pixels clamped to the
/// session canvas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GazeSample {
    pub session_id: i64,
    pub timestamp: DateTime<Utc>,
    pub gaze_x: f64,
    pub gaze_y: f64,
    pub left_pupil: Option<PupilPosition>,
    pub right_pupil: Option<PupilPosition>,
    pub left_eye_open: Option<bool>,
    pub right_eye_open: Option<bool>,
    pub head_pose: Option<HeadPose>,
    pub calibrated: bool,
    pub task_tag: Option<String>,
}
