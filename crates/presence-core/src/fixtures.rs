//! Deterministic synthetic faces and a matching three-stage cascade.
//!
//! Faces are flat squares with two dark eye bars and a dark mouth bar on a
//! mid-gray background. The fixture cascade looks for exactly that layout
//! (dark band below a bright forehead, bright bridge between the eyes, dark
//! mouth between bright cheeks) so detection results are exact and stable.

use crate::cascade::Cascade;
use crate::detector::{DetectorParams, FaceDetector};
use crate::encoder::FaceEncoder;
use crate::extractor::FeatureExtractor;
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};

pub const FIXTURE_FRAME_WIDTH: u32 = 160;
pub const FIXTURE_FRAME_HEIGHT: u32 = 120;
pub const BACKGROUND: u8 = 128;

/// Gray levels of one synthetic identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    pub skin: u8,
    pub eye: u8,
    pub mouth: u8,
}

impl Palette {
    pub const DEFAULT: Palette = Palette { skin: 200, eye: 40, mouth: 60 };
    pub const ALT: Palette = Palette { skin: 150, eye: 60, mouth: 80 };
}

fn fill(img: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, v: u8) {
    for yy in y..(y + h).min(img.height()) {
        for xx in x..(x + w).min(img.width()) {
            img.put_pixel(xx, yy, Rgb([v, v, v]));
        }
    }
}

/// Paint an `s`x`s` face with its top-left corner at `(x0, y0)`.
pub fn paint_face(img: &mut RgbImage, x0: u32, y0: u32, s: u32, palette: Palette) {
    fill(img, x0, y0, s, s, palette.skin);

    let eye_top = s * 25 / 100;
    let eye_h = s * 42 / 100 - eye_top;
    fill(img, x0 + s * 15 / 100, y0 + eye_top, s * 40 / 100 - s * 15 / 100, eye_h, palette.eye);
    fill(img, x0 + s * 60 / 100, y0 + eye_top, s * 85 / 100 - s * 60 / 100, eye_h, palette.eye);

    let mouth_top = s * 68 / 100;
    let mouth_h = s * 80 / 100 - mouth_top;
    fill(img, x0 + s * 30 / 100, y0 + mouth_top, s * 70 / 100 - s * 30 / 100, mouth_h, palette.mouth);
}

/// Background frame with default-palette faces at `(x, y, size)`.
pub fn frame_with_faces(width: u32, height: u32, faces: &[(u32, u32, u32)]) -> RgbImage {
    let mut img = RgbImage::from_pixel(width, height, Rgb([BACKGROUND; 3]));
    for &(x, y, s) in faces {
        paint_face(&mut img, x, y, s, Palette::DEFAULT);
    }
    img
}

/// Fixture-sized frame with one face per `(x, y, size, palette)`.
pub fn frame_with_palettes(faces: &[(u32, u32, u32, Palette)]) -> RgbImage {
    let mut img = RgbImage::from_pixel(
        FIXTURE_FRAME_WIDTH,
        FIXTURE_FRAME_HEIGHT,
        Rgb([BACKGROUND; 3]),
    );
    for &(x, y, s, palette) in faces {
        paint_face(&mut img, x, y, s, palette);
    }
    img
}

/// A tight `size`x`size` crop containing only the face, offset by `margin`
/// pixels of background on the top and left edges.
pub fn face_crop(size: u32, margin: u32, palette: Palette) -> RgbImage {
    let mut img = RgbImage::from_pixel(size, size, Rgb([BACKGROUND; 3]));
    paint_face(&mut img, margin, margin, size, palette);
    img
}

/// PNG bytes for an image, as an upload would arrive.
pub fn encode_png(img: &RgbImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    if let Err(e) = img.write_to(&mut out, ImageFormat::Png) {
        panic!("png encode failed: {e}");
    }
    out.into_inner()
}

/// OpenCV-format cascade tuned to the synthetic face layout.
pub const FIXTURE_CASCADE_XML: &str = include_str!("../data/fixture_cascade.xml");

/// On-disk location of [`FIXTURE_CASCADE_XML`].
pub fn fixture_cascade_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("data/fixture_cascade.xml")
}

/// 24x24 three-stage cascade: eye band darker than the forehead and cheeks,
/// nose bridge brighter than either eye, mouth darker than the skin around it.
pub fn fixture_cascade() -> Cascade {
    match Cascade::from_xml(FIXTURE_CASCADE_XML) {
        Ok(c) => c,
        Err(e) => panic!("fixture cascade does not parse: {e}"),
    }
}

pub fn fixture_params() -> DetectorParams {
    DetectorParams {
        scale_factor: 1.1,
        min_neighbors: 3,
        min_size: (24, 24),
    }
}

/// Histogram-mode extractor driven by the fixture cascade.
pub fn fixture_extractor() -> FeatureExtractor {
    let detector = match FaceDetector::new(fixture_cascade(), fixture_params()) {
        Ok(d) => d,
        Err(e) => panic!("fixture cascade rejected: {e}"),
    };
    FeatureExtractor::new(detector, FaceEncoder::Histogram, 0.6)
}
