use image::{Rgba, RgbaImage};

use super::activity_map::ActivityGrid;

fn unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

/// Blue → green → red ramp. Opacity scales with intensity, so a zero cell is
/// fully transparent.
pub fn ramp(value: f32, alpha: f32) -> Rgba<u8> {
    let v = if value.is_finite() { unit(value) } else { 0.0 };
    let r = unit(2.0 * v);
    let g = unit(1.0 - (2.0 * v - 1.0).abs());
    let b = unit(1.0 - 2.0 * v);
    let a = v * unit(alpha);
    Rgba([
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8,
        (a * 255.0).round() as u8,
    ])
}

/// Color-maps a normalized grid into an RGBA layer of the same size.
pub fn colorize(grid: &ActivityGrid, alpha: f32) -> RgbaImage {
    RgbaImage::from_fn(grid.width(), grid.height(), |x, y| ramp(grid.get(x, y), alpha))
}
