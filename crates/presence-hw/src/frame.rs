//! Frame type and pixel-format conversion to RGB.

use image::{GrayImage, RgbImage};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image decode failed: {0}")]
    Decode(String),
}

/// A captured RGB frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Driver sequence number, or position in a replayed sequence.
    pub sequence: u32,
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image,
            sequence,
            timestamp: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited-range YUV to RGB, integer arithmetic.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clamp_u8((298 * c + 409 * e + 128) >> 8),
        clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp_u8((298 * c + 516 * d + 128) >> 8),
    ]
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(yuyv, expected)?;

    let mut raw = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        raw.extend_from_slice(&yuv_to_rgb(y0, u, v));
        raw.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }

    RgbImage::from_raw(width, height, raw)
        .ok_or_else(|| FrameError::Decode("YUYV frame has odd width".into()))
}

/// Replicate 8-bit grayscale into three channels.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height) as usize;
    check_len(grey, expected)?;
    let gray = GrayImage::from_raw(width, height, grey[..expected].to_vec())
        .ok_or_else(|| FrameError::Decode("GREY buffer shape".into()))?;
    Ok(image::DynamicImage::ImageLuma8(gray).to_rgb8())
}

/// Downscale 16-bit little-endian grayscale to 8 bits, then to RGB.
pub fn y16_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len(buf, pixels * 2)?;
    let grey: Vec<u8> = buf[..pixels * 2]
        .chunks_exact(2)
        .map(|px| (u16::from_le_bytes([px[0], px[1]]) >> 8) as u8)
        .collect();
    grey_to_rgb(&grey, width, height)
}

/// Decode one Motion-JPEG frame.
pub fn decode_mjpeg(buf: &[u8]) -> Result<RgbImage, FrameError> {
    image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(|e| FrameError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_rgb_gray_levels() {
        // Two pixels: Y=16 (black) and Y=235 (white), neutral chroma.
        let yuyv = [16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(rgb.get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_yuyv_to_rgb_red_chroma() {
        // High V pushes red up and green down.
        let rgb = yuyv_to_rgb(&[81, 90, 81, 240], 2, 1).unwrap();
        let [r, g, b] = rgb.get_pixel(0, 0).0;
        assert!(r > 200, "r = {r}");
        assert!(g < 40, "g = {g}");
        assert!(b < 40, "b = {b}");
    }

    #[test]
    fn test_yuyv_too_short() {
        let err = yuyv_to_rgb(&[0; 10], 4, 2).unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength { expected: 16, actual: 10 }));
    }

    #[test]
    fn test_grey_to_rgb() {
        let rgb = grey_to_rgb(&[10, 20, 30, 40], 2, 2).unwrap();
        assert_eq!(rgb.get_pixel(1, 1).0, [40, 40, 40]);
    }

    #[test]
    fn test_y16_downscale() {
        // 0xAB12 little-endian -> high byte 0xAB.
        let rgb = y16_to_rgb(&[0x12, 0xAB], 1, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [0xAB; 3]);
    }

    #[test]
    fn test_decode_mjpeg_garbage() {
        assert!(matches!(decode_mjpeg(&[0, 1, 2, 3]), Err(FrameError::Decode(_))));
    }
}
