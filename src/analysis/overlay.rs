use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use image::{imageops, imageops::FilterType, Pixel, Rgba, RgbaImage};

use crate::{
    db::{Database, FrameArtifact, PointerEvent},
    storage::{ArtifactDir, ArtifactLayout},
};

use super::{colormap, write_png, ActivityMapEngine, AnalysisConfig};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const MARKER_FILL: Rgba<u8> = Rgba([220, 50, 50, 140]);
const MARKER_OUTLINE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const MARKER_MIN_RADIUS: f64 = 10.0;
const OUTLINE_WIDTH: f64 = 3.0;
const CENTER_DOT_RADIUS: f64 = 4.0;
const GRID_GAP: u32 = 8;

/// Events of a timestamp-sorted stream inside `[end - window, end]`.
pub fn select_window(
    events: &[PointerEvent],
    end: DateTime<Utc>,
    window: chrono::Duration,
) -> &[PointerEvent] {
    let start = end - window;
    let first = events.partition_point(|e| e.timestamp < start);
    let last = events.partition_point(|e| e.timestamp <= end);
    if first >= last {
        return &[];
    }
    &events[first..last]
}

/// One rendered composite.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedOverlay {
    pub frame_path: PathBuf,
    pub overlay_path: PathBuf,
    pub activity_events: usize,
    pub click_events: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OverlayOutcome {
    Rendered(RenderedOverlay),
    MissingFrame,
    NoEvents,
}

/// Batch result: what was written and why the rest was not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlayReport {
    pub rendered: Vec<RenderedOverlay>,
    pub missing_frames: usize,
    pub empty_windows: usize,
    pub failed: usize,
    pub comparison_grid: Option<PathBuf>,
}

impl OverlayReport {
    pub fn succeeded(&self) -> usize {
        self.rendered.len()
    }

    pub fn skipped(&self) -> usize {
        self.missing_frames + self.empty_windows + self.failed
    }
}

/// Joins frames with the events leading up to them and renders composites.
#[derive(Debug, Clone)]
pub struct OverlayCorrelationEngine {
    config: AnalysisConfig,
    layout: ArtifactLayout,
    maps: ActivityMapEngine,
}

impl OverlayCorrelationEngine {
    pub fn new(config: AnalysisConfig, layout: ArtifactLayout) -> Self {
        let maps = ActivityMapEngine::new(config.sigma);
        Self {
            config,
            layout,
            maps,
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Renders the overlay for one frame. `events` must be sorted by
    /// timestamp; `canvas` is the session's logical canvas.
    pub fn render_frame(
        &self,
        frame: &FrameArtifact,
        events: &[PointerEvent],
        canvas: (u32, u32),
    ) -> Result<OverlayOutcome> {
        let frame_path = Path::new(&frame.storage_path);
        if !frame_path.is_file() {
            return Ok(OverlayOutcome::MissingFrame);
        }

        // Only a window with no events at all is skipped; a window of
        // scrolls and releases still gets a composite, with zero heat.
        let window = select_window(events, frame.timestamp, self.config.window());
        if window.is_empty() {
            return Ok(OverlayOutcome::NoEvents);
        }
        let activity: Vec<&PointerEvent> = window.iter().filter(|e| e.is_activity()).collect();

        let mut composite = image::open(frame_path)
            .with_context(|| format!("failed to decode frame {}", frame_path.display()))?
            .to_rgba8();
        let (width, height) = composite.dimensions();

        let grid = self
            .maps
            .build(activity.iter().map(|e| e.position()), canvas)?
            .resample(width, height)?;
        let layer = colormap::colorize(&grid, self.config.overlay_alpha as f32);
        imageops::overlay(&mut composite, &layer, 0, 0);

        let sx = f64::from(width) / f64::from(canvas.0.max(1));
        let sy = f64::from(height) / f64::from(canvas.1.max(1));
        let radius = (self.config.marker_radius * sx.min(sy)).max(MARKER_MIN_RADIUS);
        let clicks: Vec<&&PointerEvent> = activity.iter().filter(|e| e.is_press()).collect();
        for click in &clicks {
            draw_marker(&mut composite, click.x * sx, click.y * sy, radius);
        }

        self.layout.ensure_dir(frame.session_id, ArtifactDir::Overlays)?;
        let overlay_path = self.layout.overlay_path(frame.session_id, frame_path);
        write_png(&composite, &overlay_path)?;

        Ok(OverlayOutcome::Rendered(RenderedOverlay {
            frame_path: frame_path.to_path_buf(),
            overlay_path,
            activity_events: activity.len(),
            click_events: clicks.len(),
        }))
    }

    /// Renders every frame, skipping the ones that cannot be rendered.
    pub fn render_batch(
        &self,
        session_id: i64,
        frames: &[FrameArtifact],
        mut events: Vec<PointerEvent>,
        canvas: (u32, u32),
        with_grid: bool,
    ) -> OverlayReport {
        events.sort_by_key(|e| e.timestamp);
        let mut report = OverlayReport::default();

        for frame in frames {
            match self.render_frame(frame, &events, canvas) {
                Ok(OverlayOutcome::Rendered(rendered)) => report.rendered.push(rendered),
                Ok(OverlayOutcome::MissingFrame) => {
                    log_warn!("frame file missing, skipping: {}", frame.storage_path);
                    report.missing_frames += 1;
                }
                Ok(OverlayOutcome::NoEvents) => report.empty_windows += 1,
                Err(err) => {
                    log_warn!("overlay failed for {}: {err:#}", frame.storage_path);
                    report.failed += 1;
                }
            }
        }

        if with_grid && !report.rendered.is_empty() {
            let path = self.layout.comparison_grid_path(session_id);
            let pairs: Vec<(PathBuf, PathBuf)> = report
                .rendered
                .iter()
                .map(|r| (r.frame_path.clone(), r.overlay_path.clone()))
                .collect();
            match build_comparison_grid(
                &pairs,
                self.config.grid_per_row,
                self.config.grid_thumb_width,
                &path,
            ) {
                Ok(()) => report.comparison_grid = Some(path),
                Err(err) => log_warn!("comparison grid failed: {err:#}"),
            }
        }

        log_info!(
            "session {session_id}: {} overlays rendered, {} skipped",
            report.succeeded(),
            report.skipped()
        );
        report
    }

    /// Loads a session's frames and events from the store and renders them.
    pub async fn render_session(
        &self,
        db: &Database,
        session_id: i64,
        with_grid: bool,
    ) -> Result<OverlayReport> {
        let session = db
            .get_session(session_id)
            .await?
            .with_context(|| format!("session {session_id} not found"))?;
        let frames = db.get_frames(session_id).await?;
        let events = db.query_events(session_id).await?;

        let engine = self.clone();
        tokio::task::spawn_blocking(move || {
            engine.render_batch(session_id, &frames, events, session.canvas(), with_grid)
        })
        .await
        .context("overlay task panicked")
    }
}

/// Blends a ring covering `inner < d <= outer` around the center; a negative
/// `inner` fills the disc.
fn draw_ring(image: &mut RgbaImage, cx: f64, cy: f64, inner: f64, outer: f64, color: Rgba<u8>) {
    let (width, height) = image.dimensions();
    let x0 = (cx - outer).floor().max(0.0) as u32;
    let y0 = (cy - outer).floor().max(0.0) as u32;
    let x1 = ((cx + outer).ceil().max(0.0) as u32).min(width.saturating_sub(1));
    let y1 = ((cy + outer).ceil().max(0.0) as u32).min(height.saturating_sub(1));
    if width == 0 || height == 0 || x0 > x1 || y0 > y1 {
        return;
    }

    for y in y0..=y1 {
        for x in x0..=x1 {
            let dx = f64::from(x) - cx;
            let dy = f64::from(y) - cy;
            let d = (dx * dx + dy * dy).sqrt();
            if d > inner && d <= outer {
                image.get_pixel_mut(x, y).blend(&color);
            }
        }
    }
}

/// Translucent disc, white outline, white center dot.
fn draw_marker(image: &mut RgbaImage, cx: f64, cy: f64, radius: f64) {
    if !cx.is_finite() || !cy.is_finite() {
        return;
    }
    draw_ring(image, cx, cy, -1.0, radius, MARKER_FILL);
    draw_ring(image, cx, cy, radius, radius + OUTLINE_WIDTH, MARKER_OUTLINE);
    draw_ring(image, cx, cy, -1.0, CENTER_DOT_RADIUS, MARKER_OUTLINE);
}

fn thumbnail(path: &Path, width: u32) -> Result<RgbaImage> {
    let image = image::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .to_rgba8();
    let (w, h) = image.dimensions();
    let width = width.max(1);
    let height = ((f64::from(h) * f64::from(width) / f64::from(w.max(1))).round() as u32).max(1);
    Ok(imageops::resize(&image, width, height, FilterType::Triangle))
}

/// Lays out `(original, overlay)` pairs side by side, `per_row` pairs per
/// row, on a white canvas.
pub fn build_comparison_grid(
    pairs: &[(PathBuf, PathBuf)],
    per_row: usize,
    thumb_width: u32,
    output: &Path,
) -> Result<()> {
    let per_row = per_row.max(1);
    let thumb_width = thumb_width.max(1);

    let mut thumbs = Vec::with_capacity(pairs.len());
    for (original, overlay) in pairs {
        thumbs.push((thumbnail(original, thumb_width)?, thumbnail(overlay, thumb_width)?));
    }
    let cell_height = thumbs
        .iter()
        .map(|(a, b)| a.height().max(b.height()))
        .max()
        .unwrap_or(1);

    let columns = (pairs.len().min(per_row) * 2) as u32;
    let rows = pairs.len().div_ceil(per_row) as u32;
    let width = columns * thumb_width + (columns + 1) * GRID_GAP;
    let height = rows * cell_height + (rows + 1) * GRID_GAP;
    let mut canvas = RgbaImage::from_pixel(width.max(1), height.max(1), Rgba([255, 255, 255, 255]));

    for (i, (original, overlay)) in thumbs.iter().enumerate() {
        let row = (i / per_row) as u32;
        let column = ((i % per_row) * 2) as u32;
        let x = GRID_GAP + column * (thumb_width + GRID_GAP);
        let y = GRID_GAP + row * (cell_height + GRID_GAP);
        imageops::overlay(&mut canvas, original, i64::from(x), i64::from(y));
        imageops::overlay(
            &mut canvas,
            overlay,
            i64::from(x + thumb_width + GRID_GAP),
            i64::from(y),
        );
    }

    write_png(&canvas, output)
}
