//! Burn face boxes and labels into RGB frames for display.
//!
//! Boxes are drawn with `imageproc`. Text needs a TrueType font: the one set
//! with [`set_label_font`], else the first of a few common system fonts. With
//! no font available frames still get their boxes, just no text.

use crate::types::FaceRect;
use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Box color on live recognition frames.
pub const RECOGNITION_BOX: Rgb<u8> = Rgb([0, 0, 225]);
/// Box color on registration frames.
pub const REGISTRATION_BOX: Rgb<u8> = Rgb([0, 0, 255]);
pub const LABEL_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
pub const PROGRESS_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

pub const BOX_THICKNESS: u32 = 2;
const LABEL_SCALE: PxScale = PxScale { x: 20.0, y: 20.0 };

const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/liberation/LiberationSans-Regular.ttf",
];

static LABEL_FONT: OnceLock<Option<FontArc>> = OnceLock::new();

#[derive(Error, Debug)]
pub enum FontError {
    #[error("reading font {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0} is not a TrueType or OpenType font")]
    Invalid(PathBuf),
    #[error("label font already chosen")]
    AlreadySet,
}

fn read_font(path: &Path) -> Result<FontArc, FontError> {
    let data = fs::read(path).map_err(|source| FontError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    FontArc::try_from_vec(data).map_err(|_| FontError::Invalid(path.to_path_buf()))
}

/// Use the font at `path` for every label. Call before the first frame is
/// annotated; afterwards the choice is fixed.
pub fn set_label_font(path: &Path) -> Result<(), FontError> {
    let font = read_font(path)?;
    LABEL_FONT.set(Some(font)).map_err(|_| FontError::AlreadySet)?;
    tracing::info!(path = %path.display(), "label font loaded");
    Ok(())
}

pub(crate) fn label_font() -> Option<&'static FontArc> {
    LABEL_FONT
        .get_or_init(|| {
            let found = FONT_CANDIDATES
                .iter()
                .find_map(|candidate| read_font(Path::new(candidate)).ok());
            if found.is_none() {
                tracing::warn!("no label font found; frames are annotated without text");
            }
            found
        })
        .as_ref()
}

/// Draw a hollow rectangle `thickness` pixels wide, inset from `rect`'s edge.
/// Parts outside the image are clipped.
pub fn draw_rect(image: &mut RgbImage, rect: FaceRect, color: Rgb<u8>, thickness: u32) {
    for inset in 0..thickness {
        if rect.width <= 2 * inset || rect.height <= 2 * inset {
            break;
        }
        let ring = Rect::at((rect.x + inset) as i32, (rect.y + inset) as i32)
            .of_size(rect.width - 2 * inset, rect.height - 2 * inset);
        draw_hollow_rect_mut(image, ring, color);
    }
}

/// Box plus a label sitting on the inside of the box's bottom edge.
pub fn label_face(image: &mut RgbImage, rect: FaceRect, label: &str, box_color: Rgb<u8>) {
    draw_rect(image, rect, box_color, BOX_THICKNESS);
    let Some(font) = label_font() else {
        return;
    };
    let (_, text_h) = text_size(LABEL_SCALE, font, label);
    let bottom = (rect.y + rect.height) as i32;
    let top = bottom - text_h as i32 - BOX_THICKNESS as i32 - 2;
    draw_text_mut(image, LABEL_COLOR, rect.x as i32 + 4, top, LABEL_SCALE, font, label);
}

/// Registration overlay: `Progress: n/limit` in the top-left corner.
pub fn draw_progress(image: &mut RgbImage, captured: usize, limit: usize) {
    if let Some(font) = label_font() {
        let text = format!("Progress: {captured}/{limit}");
        draw_text_mut(image, PROGRESS_COLOR, 10, 10, LABEL_SCALE, font, &text);
    }
}
