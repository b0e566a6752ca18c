use serde::{Deserialize, Serialize};

/// Tunables for post-session activity maps and overlays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Gaussian sigma in logical canvas pixels. `<= 0` disables smoothing.
    pub sigma: f64,

    /// Opacity of the colorized activity layer over the frame.
    pub overlay_alpha: f64,

    /// Trailing window of events joined to each frame.
    pub window_secs: f64,

    /// Click marker radius at 1:1 scale; grows or shrinks with the frame.
    pub marker_radius: f64,

    /// Original/overlay pairs per comparison grid row.
    pub grid_per_row: usize,
    pub grid_thumb_width: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sigma: 25.0,
            overlay_alpha: 0.6,
            window_secs: 5.0,
            marker_radius: 16.0,
            grid_per_row: 3,
            grid_thumb_width: 480,
        }
    }
}

impl AnalysisConfig {
    pub fn window(&self) -> chrono::Duration {
        let micros = (self.window_secs.max(0.0) * 1_000_000.0).round() as i64;
        chrono::Duration::microseconds(micros)
    }
}
