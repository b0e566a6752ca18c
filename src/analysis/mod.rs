//! Post-session analysis: activity maps and frame overlays.

pub mod activity_map;
pub mod colormap;
pub mod config;
pub mod overlay;

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use anyhow::{Context, Result};
use image::{codecs::png::PngEncoder, RgbaImage};

pub use activity_map::{ActivityGrid, ActivityMapEngine, SessionMaps};
pub use config::AnalysisConfig;
pub use overlay::{
    build_comparison_grid, select_window, OverlayCorrelationEngine, OverlayOutcome, OverlayReport,
    RenderedOverlay,
};

/// Replaces any existing file at `path`.
fn write_png(image: &RgbaImage, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    image
        .write_with_encoder(PngEncoder::new(&mut writer))
        .with_context(|| format!("failed to encode {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))
}
