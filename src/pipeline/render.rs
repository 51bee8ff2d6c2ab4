use std::{path::Path, sync::Arc};

use anyhow::{Context, Result, anyhow};
use image::RgbaImage;

use super::latest::Latest;
use crate::types::{Color, Detection, Frame};

/// Top edge floor that leaves room for the label drawn above a box.
pub const LABEL_MARGIN: u32 = 15;
/// Label baseline offset above the box.
pub const LABEL_OFFSET: u32 = 2;
const BOX_LINE_THICKNESS: u32 = 2;
const LABEL_GLYPH_WIDTH: u32 = 6;
const LABEL_HEIGHT: u32 = 10;

/// Pixel-space rectangle, inclusive corners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Rect {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DrawInstruction {
    pub rect: Rect,
    pub color: Color,
    pub label: String,
    /// Baseline origin of the label text.
    pub label_at: (u32, u32),
}

/// Everything needed to paint one display tick.
#[derive(Clone, Debug)]
pub struct RenderOutput {
    pub frame: Option<Arc<Frame>>,
    pub instructions: Vec<DrawInstruction>,
    /// True when a new result was published since the previous tick.
    pub fresh_results: bool,
}

/// Turns the latest results into draw instructions. Driven by an external
/// clock; never touches the camera or the model.
pub struct RenderLoop {
    frames: Arc<Latest<Frame>>,
    results: Arc<Latest<Vec<Detection>>>,
    seen_results: u64,
}

impl RenderLoop {
    pub fn new(frames: Arc<Latest<Frame>>, results: Arc<Latest<Vec<Detection>>>) -> Self {
        Self {
            frames,
            results,
            seen_results: 0,
        }
    }

    /// Build the instructions for one tick. `canvas` defaults to the size of
    /// the latest frame.
    pub fn tick(&mut self, canvas: Option<(u32, u32)>) -> RenderOutput {
        let frame = self.frames.read_latest();
        let version = self.results.version();
        let fresh_results = version != self.seen_results;
        self.seen_results = version;

        let size = canvas.or_else(|| frame.as_ref().map(|f| (f.width, f.height)));
        let instructions = match (self.results.read_latest(), size) {
            (Some(detections), Some((width, height))) => {
                draw_instructions(&detections, width, height)
            }
            _ => Vec::new(),
        };

        RenderOutput {
            frame,
            instructions,
            fresh_results,
        }
    }
}

pub fn draw_instructions(detections: &[Detection], width: u32, height: u32) -> Vec<DrawInstruction> {
    if width == 0 || height == 0 {
        return Vec::new();
    }

    detections
        .iter()
        .map(|det| {
            let rect = to_pixels(det, width, height);
            DrawInstruction {
                rect,
                color: det.color,
                label: det.display_text(),
                label_at: (rect.left, rect.top.saturating_sub(LABEL_OFFSET)),
            }
        })
        .collect()
}

fn to_pixels(det: &Detection, width: u32, height: u32) -> Rect {
    let max_x = width - 1;
    let max_y = height - 1;
    let min_y = LABEL_MARGIN.min(max_y);

    let scale = |v: f32, extent: u32, lo: u32, hi: u32| -> u32 {
        let px = (v * extent as f32).round();
        if px.is_nan() {
            lo
        } else {
            (px.max(0.0) as u32).clamp(lo, hi)
        }
    };

    Rect {
        left: scale(det.top_left.x, width, 0, max_x),
        top: scale(det.top_left.y, height, min_y, max_y),
        right: scale(det.bottom_right.x, width, 0, max_x),
        bottom: scale(det.bottom_right.y, height, min_y, max_y),
    }
}

/// Paint box outlines and label tabs into an RGBA buffer. Glyph rendering is
/// left to the display surface; the tab marks where the text goes.
pub fn rasterize(buffer: &mut [u8], width: u32, height: u32, instructions: &[DrawInstruction]) {
    for inst in instructions {
        let color = inst.color.to_rgba();
        stroke_rect(buffer, width, height, &inst.rect, color);

        let tab_width = LABEL_GLYPH_WIDTH * inst.label.chars().count() as u32;
        let (tx, baseline) = inst.label_at;
        let tab_top = baseline.saturating_sub(LABEL_HEIGHT);
        fill_rect(
            buffer,
            width,
            height,
            &Rect {
                left: tx,
                top: tab_top,
                right: tx.saturating_add(tab_width),
                bottom: baseline,
            },
            color,
        );
    }
}

/// Rasterize `instructions` over a copy of `frame` and write it as an image.
pub fn save_snapshot(frame: &Frame, instructions: &[DrawInstruction], path: &Path) -> Result<()> {
    let mut rgba = frame.rgba.clone();
    rasterize(&mut rgba, frame.width, frame.height, instructions);
    let image = RgbaImage::from_raw(frame.width, frame.height, rgba)
        .ok_or_else(|| anyhow!("failed to build image buffer"))?;
    image
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))
}

fn stroke_rect(buffer: &mut [u8], width: u32, height: u32, rect: &Rect, color: [u8; 4]) {
    for offset in 0..BOX_LINE_THICKNESS {
        let top = rect.top + offset;
        let bottom = rect.bottom.saturating_sub(offset);
        let left = rect.left + offset;
        let right = rect.right.saturating_sub(offset);
        if top > bottom || left > right {
            break;
        }
        for x in left..=right {
            put_pixel_safe(buffer, width, height, x, top, color);
            put_pixel_safe(buffer, width, height, x, bottom, color);
        }
        for y in top..=bottom {
            put_pixel_safe(buffer, width, height, left, y, color);
            put_pixel_safe(buffer, width, height, right, y, color);
        }
    }
}

fn fill_rect(buffer: &mut [u8], width: u32, height: u32, rect: &Rect, color: [u8; 4]) {
    for y in rect.top..rect.bottom.min(height) {
        for x in rect.left..rect.right.min(width) {
            put_pixel_safe(buffer, width, height, x, y, color);
        }
    }
}

fn put_pixel_safe(buffer: &mut [u8], width: u32, height: u32, x: u32, y: u32, color: [u8; 4]) {
    if x >= width || y >= height {
        return;
    }
    let idx = ((y as usize) * (width as usize) + x as usize) * 4;
    if idx + 3 < buffer.len() {
        buffer[idx..idx + 4].copy_from_slice(&color);
    }
}
