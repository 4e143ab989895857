use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use thiserror::Error;

use emolens_types::models::{FaceEmotion, Region};

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;
const BAR_HEIGHT: u32 = 6;
/// Gap between the confidence bar and the top edge of the box.
const BAR_GAP: u32 = 4;

/// Formats accepted for upload. Each one round-trips through the encoder
/// so the annotated copy keeps the original format.
pub const SUPPORTED_FORMATS: &[ImageFormat] = &[
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::WebP,
    ImageFormat::Bmp,
];

#[derive(Debug, Error)]
pub enum AnnotateError {
    #[error("unsupported image format")]
    UnsupportedFormat,
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("failed to encode image: {0}")]
    Encode(String),
}

/// Sniff the encoded bytes and return the format if uploads accept it.
pub fn detect_format(bytes: &[u8]) -> Result<ImageFormat, AnnotateError> {
    let format = image::guess_format(bytes).map_err(|_| AnnotateError::UnsupportedFormat)?;
    if SUPPORTED_FORMATS.contains(&format) {
        Ok(format)
    } else {
        Err(AnnotateError::UnsupportedFormat)
    }
}

/// Decode `bytes`, draw every face, and re-encode in `format`.
pub fn render(bytes: &[u8], format: ImageFormat, faces: &[FaceEmotion]) -> Result<Vec<u8>, AnnotateError> {
    let mut img = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| AnnotateError::Decode(e.to_string()))?
        .to_rgb8();

    for face in faces {
        draw_face(&mut img, face);
    }

    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), format)
        .map_err(|e| AnnotateError::Encode(e.to_string()))?;
    Ok(out)
}

/// Outline the face and draw a bar whose width tracks the dominant-emotion
/// confidence. The bar sits above the box, or just inside it when the box
/// touches the top of the image.
pub fn draw_face(img: &mut RgbImage, face: &FaceEmotion) {
    let Region { x, y, w, h } = face.region;
    if w <= 0 || h <= 0 {
        return;
    }
    // Regions come from the analyzer; widen so edge coordinates cannot overflow.
    let (x, y) = (i64::from(x), i64::from(y));
    draw_outline(img, x, y, w as u32, h as u32, BOX_THICKNESS, BOX_COLOR);

    let fraction = (face.confidence / 100.0).clamp(0.0, 1.0);
    let bar_width = (w as f64 * fraction).round() as u32;
    if bar_width == 0 {
        return;
    }

    let above = y - i64::from(BAR_GAP + BAR_HEIGHT);
    let bar_y = if above >= 0 {
        above
    } else {
        y + i64::from(BOX_THICKNESS + 1)
    };
    fill_rect(img, x, bar_y, bar_width, BAR_HEIGHT, BOX_COLOR);
}

fn draw_outline(img: &mut RgbImage, x: i64, y: i64, w: u32, h: u32, thickness: u32, color: Rgb<u8>) {
    let t = thickness.min(w).min(h);
    fill_rect(img, x, y, w, t, color);
    fill_rect(img, x, y + i64::from(h - t), w, t, color);
    fill_rect(img, x, y, t, h, color);
    fill_rect(img, x + i64::from(w - t), y, t, h, color);
}

/// Fill a rectangle, clipped to the image.
fn fill_rect(img: &mut RgbImage, x: i64, y: i64, w: u32, h: u32, color: Rgb<u8>) {
    let (img_w, img_h) = img.dimensions();
    let x0 = x.max(0);
    let y0 = y.max(0);
    let x1 = (x + i64::from(w)).min(i64::from(img_w));
    let y1 = (y + i64::from(h)).min(i64::from(img_h));

    for py in y0..y1 {
        for px in x0..x1 {
            img.put_pixel(px as u32, py as u32, color);
        }
    }
}
