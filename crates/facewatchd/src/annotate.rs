use ab_glyph::{FontVec, PxScale};
use facewatch_core::FaceResult;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;

const KNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: f32 = 18.0;
/// Height of the tag bar drawn when no font is available.
const TAG_HEIGHT: u32 = 6;

/// Draws face boxes and labels onto frames.
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    /// Boxes and tag bars only.
    pub fn plain() -> Self {
        Self { font: None }
    }

    /// Load a label font, falling back to [`plain`](Self::plain) if it
    /// cannot be read or parsed.
    pub fn with_font_file(path: &Path) -> Self {
        let font = std::fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| FontVec::try_from_vec(bytes).map_err(|e| e.to_string()));
        match font {
            Ok(font) => {
                tracing::info!(path = %path.display(), "label font loaded");
                Self { font: Some(font) }
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "label font unavailable; drawing boxes only"
                );
                Self::plain()
            }
        }
    }

    pub fn annotate(&self, image: &mut RgbImage, results: &[FaceResult]) {
        for result in results {
            let color = if result.is_unknown() { UNKNOWN_COLOR } else { KNOWN_COLOR };
            let b = result.bbox.clamp(image.width(), image.height());
            if b.is_empty() {
                continue;
            }

            for inset in 0..BOX_THICKNESS {
                let w = b.width() as i32 - 2 * inset;
                let h = b.height() as i32 - 2 * inset;
                if w <= 0 || h <= 0 {
                    break;
                }
                let rect = Rect::at(b.x1 + inset, b.y1 + inset).of_size(w as u32, h as u32);
                draw_hollow_rect_mut(image, rect, color);
            }

            match &self.font {
                Some(font) => {
                    let text = format!("{} ({:.2})", result.name, result.score);
                    let (tw, th) = text_size(PxScale::from(LABEL_SCALE), font, &text);
                    let y = (b.y1 - th as i32 - 4).max(0);
                    let bar = Rect::at(b.x1, y).of_size(tw.max(1) + 4, th.max(1) + 4);
                    draw_filled_rect_mut(image, bar, color);
                    let scale = PxScale::from(LABEL_SCALE);
                    draw_text_mut(image, TEXT_COLOR, b.x1 + 2, y + 2, scale, font, &text);
                }
                None => {
                    let y = (b.y1 - TAG_HEIGHT as i32).max(0);
                    let tag = Rect::at(b.x1, y).of_size(b.width(), TAG_HEIGHT);
                    draw_filled_rect_mut(image, tag, color);
                }
            }
        }
    }
}
