// src/transcript.rs

use crate::error::ScanError;
use crate::geometry::{self, BoundingBox};
use image::{ImageFormat, Rgba};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tracing::info;

/// One recognized span of text plus its normalized bounding box, as produced
/// by the recognition collaborator. Consumed once per scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextFragment {
    pub text: String,
    pub bounds: BoundingBox,
}

/// The recognition output for one capture: unordered fragments plus the raw
/// EXIF orientation the engine saw the buffer in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizedText {
    pub fragments: Vec<TextFragment>,
    #[serde(default = "default_orientation")]
    pub orientation: u16,
}

fn default_orientation() -> u16 {
    1
}

/// The reading-ordered text block assembled from one capture's fragments.
/// Exists only for the duration of one extraction call; never persisted.
#[derive(Debug, Clone)]
pub struct Transcript {
    lines: Vec<String>,
}

impl Transcript {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Reconstruct the reading order of a receipt from unordered fragments.
///
/// Fragments with whitespace-only text are dropped. The rest are stable-sorted
/// by the top edge of their display-space box, so ties keep the engine's
/// original order. Boxes outside [0,1] sort by whatever top value they have;
/// no clamping happens.
pub fn build_transcript(page: &RecognizedText) -> Transcript {
    let mut ordered: Vec<(f64, &str)> = page
        .fragments
        .iter()
        .filter(|f| !f.text.trim().is_empty())
        .map(|f| {
            let display = geometry::display_box(f.bounds, page.orientation);
            (display.min_y, f.text.trim())
        })
        .collect();

    // sort_by is stable
    ordered.sort_by(|a, b| a.0.total_cmp(&b.0));

    let lines: Vec<String> = ordered.into_iter().map(|(_, t)| t.to_string()).collect();
    info!(
        fragments = page.fragments.len(),
        lines = lines.len(),
        "Transcript assembled"
    );
    Transcript { lines }
}

const OVERLAY_STROKE: Rgba<u8> = Rgba([255, 0, 0, 255]);

/// Stroke one rectangle per retained fragment onto the capture and re-encode
/// as PNG, for operator verification of what the engine saw.
///
/// Rectangles use the engine's native convention (origin bottom-left), so the
/// overlay lines up with the physical orientation of the capture buffer, not
/// the display-space boxes used for sorting. Zero fragments produce a plain
/// re-encoded copy of the input.
pub fn render_overlay(image_bytes: &[u8], page: &RecognizedText) -> Result<Vec<u8>, ScanError> {
    let decoded = image::load_from_memory(image_bytes)
        .map_err(|e| ScanError::Recognition(format!("could not decode capture image: {e}")))?;
    let mut canvas = decoded.to_rgba8();
    let (width, height) = canvas.dimensions();

    for fragment in page.fragments.iter().filter(|f| !f.text.trim().is_empty()) {
        let b = fragment.bounds;
        let x = (b.min_x * width as f64).clamp(0.0, width.saturating_sub(1) as f64) as i32;
        let y = ((1.0 - b.max_y) * height as f64).clamp(0.0, height.saturating_sub(1) as f64) as i32;
        let w = (((b.max_x - b.min_x) * width as f64) as u32).max(1);
        let h = (((b.max_y - b.min_y) * height as f64) as u32).max(1);
        draw_hollow_rect_mut(&mut canvas, Rect::at(x, y).of_size(w, h), OVERLAY_STROKE);
    }

    let mut out = Cursor::new(Vec::new());
    canvas
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| ScanError::Recognition(format!("could not encode overlay image: {e}")))?;
    Ok(out.into_inner())
}
