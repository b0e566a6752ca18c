//! Spatial activity accumulation.
//!
//! Events are binned into a grid at logical canvas resolution, blurred with
//! a separable Gaussian and normalized so the hottest cell is exactly 1.0.
//! Every step is deterministic: the same events, canvas and sigma always
//! produce a bit-identical grid.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use image::{imageops, imageops::FilterType, ImageBuffer, Luma, Rgba, RgbaImage};

use crate::{
    db::{Database, PointerEvent, PointerEventKind},
    storage::{ArtifactDir, ArtifactLayout},
};

use super::{colormap, write_png};

const ENABLE_LOGS: bool = true;

use crate::log_info;

/// Gutter between the two panels of a comparison image.
const COMPARISON_GAP: u32 = 16;

/// Row-major grid of `f32` intensities.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityGrid {
    width: u32,
    height: u32,
    cells: Vec<f32>,
}

impl ActivityGrid {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("activity grid needs a non-empty canvas, got {width}x{height}");
        }
        Ok(Self {
            width,
            height,
            cells: vec![0.0; width as usize * height as usize],
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.cells[y as usize * self.width as usize + x as usize]
    }

    pub fn cells(&self) -> &[f32] {
        &self.cells
    }

    pub fn total(&self) -> f64 {
        self.cells.iter().map(|&v| f64::from(v)).sum()
    }

    pub fn max(&self) -> f32 {
        self.cells.iter().copied().fold(0.0, f32::max)
    }

    /// Adds one count at the cell containing `(x, y)`, clamped to the
    /// canvas. Non-finite coordinates are ignored.
    pub fn add_point(&mut self, x: f64, y: f64) {
        if !x.is_finite() || !y.is_finite() {
            return;
        }
        let col = (x.floor() as i64).clamp(0, i64::from(self.width) - 1) as usize;
        let row = (y.floor() as i64).clamp(0, i64::from(self.height) - 1) as usize;
        self.cells[row * self.width as usize + col] += 1.0;
    }

    pub fn accumulate<I>(&mut self, points: I)
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        for (x, y) in points {
            self.add_point(x, y);
        }
    }

    /// Separable Gaussian blur with mirrored edges. `sigma <= 0` is a no-op.
    pub fn smooth(&mut self, sigma: f64) {
        let Some(kernel) = gaussian_kernel(sigma) else {
            return;
        };
        let width = self.width as usize;
        let height = self.height as usize;
        let mut scratch = vec![0.0f32; width];

        for row in 0..height {
            let cells = &mut self.cells[row * width..(row + 1) * width];
            if cells.iter().all(|&v| v == 0.0) {
                continue;
            }
            convolve(cells, &kernel, &mut scratch);
            cells.copy_from_slice(&scratch);
        }

        let mut column = vec![0.0f32; height];
        let mut blurred = vec![0.0f32; height];
        for col in 0..width {
            for row in 0..height {
                column[row] = self.cells[row * width + col];
            }
            if column.iter().all(|&v| v == 0.0) {
                continue;
            }
            convolve(&column, &kernel, &mut blurred);
            for row in 0..height {
                self.cells[row * width + col] = blurred[row];
            }
        }
    }

    /// Scales so the maximum becomes 1.0. An all-zero grid stays all-zero.
    pub fn normalize(&mut self) {
        let max = self.max();
        if max <= 0.0 {
            return;
        }
        for cell in &mut self.cells {
            *cell /= max;
        }
    }

    /// Lanczos3 resample to another resolution, clamped back into [0, 1].
    pub fn resample(&self, width: u32, height: u32) -> Result<Self> {
        if width == self.width && height == self.height {
            return Ok(self.clone());
        }
        if width == 0 || height == 0 {
            bail!("cannot resample activity grid to {width}x{height}");
        }
        let source: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_raw(self.width, self.height, self.cells.clone())
                .ok_or_else(|| anyhow!("activity grid buffer does not match its size"))?;
        let resized = imageops::resize(&source, width, height, FilterType::Lanczos3);
        let cells = resized
            .into_raw()
            .into_iter()
            .map(|v| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 })
            .collect();
        Ok(Self {
            width,
            height,
            cells,
        })
    }
}

fn gaussian_kernel(sigma: f64) -> Option<Vec<f64>> {
    if !sigma.is_finite() || sigma <= 0.0 {
        return None;
    }
    let radius = (4.0 * sigma).round() as i64;
    let mut weights: Vec<f64> = (-radius..=radius)
        .map(|offset| {
            let t = offset as f64 / sigma;
            (-0.5 * t * t).exp()
        })
        .collect();
    let sum: f64 = weights.iter().sum();
    for weight in &mut weights {
        *weight /= sum;
    }
    Some(weights)
}

/// Mirror index into `0..len`: `d c b a | a b c d | d c b a`.
fn reflect(index: i64, len: usize) -> usize {
    let len = len as i64;
    let period = 2 * len;
    let folded = index.rem_euclid(period);
    if folded < len {
        folded as usize
    } else {
        (period - 1 - folded) as usize
    }
}

fn convolve(input: &[f32], kernel: &[f64], output: &mut [f32]) {
    let radius = (kernel.len() / 2) as i64;
    let len = input.len();
    for (i, out) in output.iter_mut().enumerate().take(len) {
        let mut acc = 0.0f64;
        for (k, weight) in kernel.iter().enumerate() {
            let source = reflect(i as i64 + k as i64 - radius, len);
            acc += weight * f64::from(input[source]);
        }
        *out = acc as f32;
    }
}

/// Paths written by [`ActivityMapEngine::render_session_maps`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMaps {
    pub activity: PathBuf,
    pub clicks: PathBuf,
    /// Moves beside presses; absent when the session has neither.
    pub comparison: Option<PathBuf>,
    pub activity_events: usize,
    pub click_events: usize,
}

/// Places `left` and `right` next to each other on a light gray sheet,
/// top-aligned, with a fixed gutter between them.
pub fn side_by_side(left: &RgbaImage, right: &RgbaImage) -> RgbaImage {
    let width = left.width() + COMPARISON_GAP + right.width();
    let height = left.height().max(right.height());
    let mut sheet = RgbaImage::from_pixel(width, height, Rgba([230, 230, 230, 255]));
    imageops::replace(&mut sheet, left, 0, 0);
    imageops::replace(
        &mut sheet,
        right,
        i64::from(left.width() + COMPARISON_GAP),
        0,
    );
    sheet
}

/// Builds smoothed, normalized activity grids from positioned events.
#[derive(Debug, Clone, Copy)]
pub struct ActivityMapEngine {
    sigma: f64,
}

impl ActivityMapEngine {
    pub fn new(sigma: f64) -> Self {
        Self { sigma }
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Accumulate, smooth, normalize.
    pub fn build<I>(&self, points: I, canvas: (u32, u32)) -> Result<ActivityGrid>
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        let mut grid = ActivityGrid::new(canvas.0, canvas.1)?;
        grid.accumulate(points);
        grid.smooth(self.sigma);
        grid.normalize();
        Ok(grid)
    }

    /// Grid of moves and presses.
    pub fn activity_grid(&self, events: &[PointerEvent], canvas: (u32, u32)) -> Result<ActivityGrid> {
        self.build(
            events.iter().filter(|e| e.is_activity()).map(PointerEvent::position),
            canvas,
        )
    }

    /// Grid of moves only.
    pub fn move_grid(&self, events: &[PointerEvent], canvas: (u32, u32)) -> Result<ActivityGrid> {
        self.build(
            events
                .iter()
                .filter(|e| e.kind == PointerEventKind::Move)
                .map(PointerEvent::position),
            canvas,
        )
    }

    /// Grid of presses only.
    pub fn click_grid(&self, events: &[PointerEvent], canvas: (u32, u32)) -> Result<ActivityGrid> {
        self.build(
            events.iter().filter(|e| e.is_press()).map(PointerEvent::position),
            canvas,
        )
    }

    /// Colorized grid over a white background at canvas resolution.
    pub fn render(&self, grid: &ActivityGrid) -> RgbaImage {
        let mut canvas = RgbaImage::from_pixel(grid.width(), grid.height(), Rgba([255, 255, 255, 255]));
        imageops::overlay(&mut canvas, &colormap::colorize(grid, 1.0), 0, 0);
        canvas
    }

    /// Writes whole-session activity and click maps under the session's
    /// overlay directory, plus a moves-versus-presses comparison when there
    /// is anything to compare.
    pub async fn render_session_maps(
        &self,
        db: &Database,
        layout: &ArtifactLayout,
        session_id: i64,
    ) -> Result<SessionMaps> {
        let session = db
            .get_session(session_id)
            .await?
            .with_context(|| format!("session {session_id} not found"))?;
        let events = db.query_events(session_id).await?;
        layout.ensure_dir(session_id, ArtifactDir::Overlays)?;

        let engine = *self;
        let layout = layout.clone();
        let canvas = session.canvas();
        tokio::task::spawn_blocking(move || {
            let activity_events = events.iter().filter(|e| e.is_activity()).count();
            let click_events = events.iter().filter(|e| e.is_press()).count();

            let activity = layout.activity_map_path(session_id, "activity");
            write_png(&engine.render(&engine.activity_grid(&events, canvas)?), &activity)?;

            let clicks = layout.activity_map_path(session_id, "click");
            let click_map = engine.render(&engine.click_grid(&events, canvas)?);
            write_png(&click_map, &clicks)?;

            let moves = events
                .iter()
                .filter(|e| e.kind == PointerEventKind::Move)
                .count();
            let comparison = if moves + click_events > 0 {
                let path = layout.activity_map_path(session_id, "comparison");
                let move_map = engine.render(&engine.move_grid(&events, canvas)?);
                write_png(&side_by_side(&move_map, &click_map), &path)?;
                Some(path)
            } else {
                None
            };

            log_info!(
                "session {session_id}: activity map from {activity_events} events, click map from {click_events}"
            );
            Ok(SessionMaps {
                activity,
                clicks,
                comparison,
                activity_events,
                click_events,
            })
        })
        .await
        .context("activity map task panicked")?
    }
}
