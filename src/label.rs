use anyhow::{Context, Result};
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};
use serde::Serialize;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::matcher::{MatchStrategy, ProfileLibrary};
use crate::models::image::BoundingBox;
use crate::pipeline::encode::FaceEncoder;

const BOX_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BOX_THICKNESS: u32 = 2;
const CAPTION_PX: f32 = 14.0;
const CAPTION_PAD: u32 = 5;

// Tried in order when no caption font is configured
const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/Library/Fonts/Arial.ttf",
];

#[derive(Clone, Debug, Serialize)]
pub struct FaceLabel {
    pub bbox: BoundingBox,
    pub name: String,
    pub score: f32,
}

pub struct LabeledImage {
    pub jpeg: Vec<u8>,
    pub faces: Vec<FaceLabel>,
}

/// Load the TrueType font used for name captions: `configured` if given,
/// otherwise the first common system font found. `None` leaves the caption
/// bars unnamed.
pub fn load_caption_font(configured: Option<&Path>) -> Option<Font<'static>> {
    let candidates: Vec<PathBuf> = match configured {
        Some(p) => vec![p.to_path_buf()],
        None => SYSTEM_FONTS.iter().map(PathBuf::from).collect(),
    };
    for path in candidates {
        let Ok(bytes) = std::fs::read(&path) else {
            continue;
        };
        match Font::try_from_vec(bytes) {
            Some(font) => {
                debug!("Caption font: {:?}", path);
                return Some(font);
            }
            None => warn!("{:?} is not a usable TrueType font", path),
        }
    }
    warn!("No caption font available; labeled images will not show names");
    None
}

/// `bbox` clamped into the image, or `None` for an empty image.
fn clamp_box(img: &RgbImage, bbox: &BoundingBox) -> Option<BoundingBox> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return None;
    }
    let left = bbox.left.min(w - 1);
    let top = bbox.top.min(h - 1);
    Some(BoundingBox {
        top,
        right: bbox.right.min(w - 1).max(left),
        bottom: bbox.bottom.min(h - 1).max(top),
        left,
    })
}

fn draw_box(img: &mut RgbImage, bbox: &BoundingBox) {
    let Some(b) = clamp_box(img, bbox) else {
        return;
    };
    let (w, h) = (b.right - b.left + 1, b.bottom - b.top + 1);
    for t in 0..BOX_THICKNESS {
        if w <= 2 * t || h <= 2 * t {
            break;
        }
        let rect = Rect::at((b.left + t) as i32, (b.top + t) as i32).of_size(w - 2 * t, h - 2 * t);
        draw_hollow_rect_mut(img, rect, BOX_COLOR);
    }
}

/// Filled bar along the bottom of the face box with the name on it.
fn draw_caption(img: &mut RgbImage, bbox: &BoundingBox, name: &str, font: Option<&Font<'_>>) {
    let Some(b) = clamp_box(img, bbox) else {
        return;
    };
    let scale = Scale::uniform(CAPTION_PX);
    let text_h = match font {
        Some(f) => text_size(scale, f, name).1.max(0) as u32,
        None => CAPTION_PX as u32,
    };
    let bar_h = (text_h + 2 * CAPTION_PAD).min(b.bottom - b.top + 1);
    let bar_top = b.bottom + 1 - bar_h;
    let width = b.right - b.left + 1;
    draw_filled_rect_mut(img, Rect::at(b.left as i32, bar_top as i32).of_size(width, bar_h), BOX_COLOR);
    if let Some(f) = font {
        draw_text_mut(img, TEXT_COLOR, (b.left + 6) as i32, (bar_top + CAPTION_PAD) as i32, scale, f, name);
    }
}

/// Name every face in an uploaded image with its closest profile and return
/// the image with each face outlined and captioned.
pub fn label_image(
    encoder: &FaceEncoder,
    library: &ProfileLibrary,
    font: Option<&Font<'_>>,
    bytes: &[u8],
) -> Result<LabeledImage> {
    let img = image::load_from_memory(bytes).context("decoding uploaded image")?;
    let observations = encoder.encode_image(&img)?;
    let faces: Vec<FaceLabel> = observations
        .into_iter()
        .map(|obs| {
            let m = library.best_match(&obs.embedding, MatchStrategy::SimilarityRank);
            FaceLabel { bbox: obs.bbox, name: m.name, score: m.score }
        })
        .collect();

    let mut canvas = img.to_rgb8();
    for face in &faces {
        draw_box(&mut canvas, &face.bbox);
        draw_caption(&mut canvas, &face.bbox, &face.name, font);
    }
    let mut jpeg = Vec::new();
    DynamicImage::ImageRgb8(canvas)
        .write_to(&mut Cursor::new(&mut jpeg), ImageOutputFormat::Jpeg(90))
        .context("encoding labeled image")?;
    Ok(LabeledImage { jpeg, faces })
}
