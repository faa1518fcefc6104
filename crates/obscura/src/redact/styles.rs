//! Pixel operations for the redaction styles.
//!
//! All operations write into a mutable output raster, never into the source
//! page. Boxes handed to this module are already clipped to the image.

use image::{Rgba, RgbaImage};

use crate::error::{ObscuraError, Result};
use crate::profile::{PatternId, RgbColor, StyleSpec};
use crate::types::BoundingBox;

/// Hatch stroke spacing in pixels.
const HATCH_PERIOD: u32 = 6;

/// Applies `style` to `bbox` of the output raster.
pub fn apply_style(out: &mut RgbaImage, bbox: &BoundingBox, style: &StyleSpec) -> Result<()> {
    if bbox.right() > out.width() || bbox.bottom() > out.height() {
        return Err(ObscuraError::redaction(format!(
            "box ({}, {}, {}, {}) exceeds output raster {}x{}",
            bbox.x,
            bbox.y,
            bbox.w,
            bbox.h,
            out.width(),
            out.height()
        )));
    }
    match style {
        StyleSpec::Solid { color } => {
            fill_solid(out, bbox, *color);
            Ok(())
        }
        StyleSpec::Pixelate { block_px } => pixelate(out, bbox, *block_px),
        StyleSpec::Blur {
            radius_px,
            iterations,
        } => blur(out, bbox, *radius_px, *iterations),
        StyleSpec::Pattern { id } => {
            pattern(out, bbox, *id);
            Ok(())
        }
    }
}

/// Fills `bbox` with `color` at full opacity.
pub fn fill_solid(out: &mut RgbaImage, bbox: &BoundingBox, color: RgbColor) {
    let pixel = color.to_rgba();
    for y in bbox.y..bbox.bottom() {
        for x in bbox.x..bbox.right() {
            out.put_pixel(x, y, pixel);
        }
    }
}

/// Downsamples the region to `block_px` cells (nearest-neighbor) and blows
/// each cell back up, destroying sub-block detail.
fn pixelate(out: &mut RgbaImage, bbox: &BoundingBox, block_px: u32) -> Result<()> {
    if block_px == 0 {
        return Err(ObscuraError::redaction("pixelate block size is zero"));
    }
    let mut by = bbox.y;
    while by < bbox.bottom() {
        let mut bx = bbox.x;
        let block_h = block_px.min(bbox.bottom() - by);
        while bx < bbox.right() {
            let block_w = block_px.min(bbox.right() - bx);
            // Nearest-neighbor sample at the block center.
            let sample = *out.get_pixel(bx + block_w / 2, by + block_h / 2);
            for y in by..by + block_h {
                for x in bx..bx + block_w {
                    out.put_pixel(x, y, sample);
                }
            }
            bx += block_px;
        }
        by += block_px;
    }
    Ok(())
}

/// Iterated separable box blur over the region.
///
/// Each iteration runs a horizontal then a vertical pass with the given
/// radius, clamping at the region edges so pixels outside the box never leak
/// in or out.
fn blur(out: &mut RgbaImage, bbox: &BoundingBox, radius_px: u32, iterations: u32) -> Result<()> {
    if radius_px == 0 || iterations == 0 {
        return Err(ObscuraError::redaction("blur radius or iterations is zero"));
    }
    let w = bbox.w as usize;
    let h = bbox.h as usize;
    let radius = radius_px as isize;

    // Region-local working copy, one Vec<[u16; 4]> per pass.
    let mut region: Vec<[u16; 4]> = Vec::with_capacity(w * h);
    for y in bbox.y..bbox.bottom() {
        for x in bbox.x..bbox.right() {
            let p = out.get_pixel(x, y).0;
            region.push([p[0] as u16, p[1] as u16, p[2] as u16, p[3] as u16]);
        }
    }

    let mut scratch = region.clone();
    for _ in 0..iterations {
        // Horizontal pass: region -> scratch.
        for y in 0..h {
            for x in 0..w {
                let mut acc = [0u32; 4];
                let mut count = 0u32;
                for dx in -radius..=radius {
                    let sx = (x as isize + dx).clamp(0, w as isize - 1) as usize;
                    let p = region[y * w + sx];
                    for (a, &v) in acc.iter_mut().zip(p.iter()) {
                        *a += v as u32;
                    }
                    count += 1;
                }
                scratch[y * w + x] = [
                    (acc[0] / count) as u16,
                    (acc[1] / count) as u16,
                    (acc[2] / count) as u16,
                    (acc[3] / count) as u16,
                ];
            }
        }
        // Vertical pass: scratch -> region.
        for y in 0..h {
            for x in 0..w {
                let mut acc = [0u32; 4];
                let mut count = 0u32;
                for dy in -radius..=radius {
                    let sy = (y as isize + dy).clamp(0, h as isize - 1) as usize;
                    let p = scratch[sy * w + x];
                    for (a, &v) in acc.iter_mut().zip(p.iter()) {
                        *a += v as u32;
                    }
                    count += 1;
                }
                region[y * w + x] = [
                    (acc[0] / count) as u16,
                    (acc[1] / count) as u16,
                    (acc[2] / count) as u16,
                    (acc[3] / count) as u16,
                ];
            }
        }
    }

    let mut i = 0;
    for y in bbox.y..bbox.bottom() {
        for x in bbox.x..bbox.right() {
            let p = region[i];
            out.put_pixel(
                x,
                y,
                Rgba([p[0] as u8, p[1] as u8, p[2] as u8, p[3] as u8]),
            );
            i += 1;
        }
    }
    Ok(())
}

/// Deterministic full-opacity hatch overlay: white ground, black strokes.
fn pattern(out: &mut RgbaImage, bbox: &BoundingBox, id: PatternId) {
    let white = Rgba([255, 255, 255, 255]);
    let black = Rgba([0, 0, 0, 255]);
    for y in bbox.y..bbox.bottom() {
        for x in bbox.x..bbox.right() {
            // Stroke positions are taken relative to the box origin so the
            // pattern is independent of page placement.
            let rx = x - bbox.x;
            let ry = y - bbox.y;
            let on_diagonal = (rx + ry) % HATCH_PERIOD == 0;
            let on_anti = matches!(id, PatternId::CrossHatch)
                && (rx + HATCH_PERIOD - ry % HATCH_PERIOD) % HATCH_PERIOD == 0;
            let pixel = if on_diagonal || on_anti { black } else { white };
            out.put_pixel(x, y, pixel);
        }
    }
}
