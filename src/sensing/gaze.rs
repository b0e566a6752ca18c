use anyhow::Result;
use chrono::{DateTime, Utc};
use image::RgbImage;

use crate::db::{Artifact, GazeSample, HeadPose, PupilPosition};

use super::{biometric::CameraSource, sampler::SampleSource, PipelineHealth, SourceKind, TaskTag};

const ENABLE_LOGS: bool = true;

use crate::log_warn;

/// Eye aspect ratio above which an eye counts as open.
pub const EYE_OPEN_RATIO: f64 = 0.02;

/// Raw estimator output for one camera frame.
#[derive(Debug, Clone, PartialEq)]
pub struct GazeEstimate {
    /// Screen-space gaze point in pixels, before clamping to the canvas.
    pub screen_x: f64,
    pub screen_y: f64,
    pub left_pupil: Option<PupilPosition>,
    pub right_pupil: Option<PupilPosition>,
    /// Eye aspect ratios (lid height over eye width).
    pub left_eye_ratio: Option<f64>,
    pub right_eye_ratio: Option<f64>,
    pub head_pose: Option<HeadPose>,
    /// Whether a fitted calibration produced the screen point.
    pub calibrated: bool,
}

/// Opaque face/iris landmark model. `Ok(None)` means no face was found.
pub trait GazeEstimator: Send + 'static {
    fn estimate(&mut self, frame: &RgbImage, canvas: (u32, u32)) -> Result<Option<GazeEstimate>>;
}

fn finite_pupil(pupil: Option<PupilPosition>) -> Option<PupilPosition> {
    pupil.filter(|p| p.x.is_finite() && p.y.is_finite())
}

fn eye_open(ratio: Option<f64>) -> Option<bool> {
    ratio.filter(|r| r.is_finite()).map(|r| r > EYE_OPEN_RATIO)
}

/// Polls the camera at the gaze rate and records one sample per frame with a
/// face in it.
pub struct GazeSampler {
    camera: Box<dyn CameraSource>,
    estimator: Box<dyn GazeEstimator>,
    session_id: i64,
    canvas: (u32, u32),
    task_tag: TaskTag,
    health: PipelineHealth,
    rejected: u64,
}

impl GazeSampler {
    pub fn new(
        camera: Box<dyn CameraSource>,
        estimator: Box<dyn GazeEstimator>,
        session_id: i64,
        canvas: (u32, u32),
        task_tag: TaskTag,
        health: PipelineHealth,
    ) -> Self {
        Self {
            camera,
            estimator,
            session_id,
            canvas,
            task_tag,
            health,
            rejected: 0,
        }
    }

    /// Clamps the gaze point to the canvas. A non-finite gaze point yields
    /// `None`; non-finite landmarks are dropped from an otherwise valid
    /// sample.
    pub fn to_sample(&self, raw: GazeEstimate, timestamp: DateTime<Utc>) -> Option<GazeSample> {
        if !raw.screen_x.is_finite() || !raw.screen_y.is_finite() {
            return None;
        }
        let (width, height) = self.canvas;
        let head_pose = raw
            .head_pose
            .filter(|pose| pose.yaw.is_finite() && pose.pitch.is_finite() && pose.depth.is_finite());

        Some(GazeSample {
            session_id: self.session_id,
            timestamp,
            gaze_x: raw.screen_x.clamp(0.0, f64::from(width)),
            gaze_y: raw.screen_y.clamp(0.0, f64::from(height)),
            left_pupil: finite_pupil(raw.left_pupil),
            right_pupil: finite_pupil(raw.right_pupil),
            left_eye_open: eye_open(raw.left_eye_ratio),
            right_eye_open: eye_open(raw.right_eye_ratio),
            head_pose,
            calibrated: raw.calibrated,
            task_tag: self.task_tag.get(),
        })
    }
}

impl SampleSource for GazeSampler {
    type Output = Artifact;

    fn kind(&self) -> SourceKind {
        SourceKind::Gaze
    }

    fn open(&mut self) -> Result<()> {
        self.camera.open()
    }

    fn poll(&mut self, now: DateTime<Utc>) -> Result<Vec<Artifact>> {
        let frame = self.camera.grab()?;
        let Some(raw) = self.estimator.estimate(&frame, self.canvas)? else {
            return Ok(Vec::new());
        };
        match self.to_sample(raw, now) {
            Some(sample) => Ok(vec![Artifact::Gaze(sample)]),
            None => {
                self.rejected += 1;
                self.health.record_invalid_sample();
                if self.rejected == 1 {
                    log_warn!("discarding gaze estimate with non-finite screen point");
                }
                Ok(Vec::new())
            }
        }
    }

    fn finish(&mut self, _now: DateTime<Utc>) -> Result<Vec<Artifact>> {
        Ok(Vec::new())
    }
}
