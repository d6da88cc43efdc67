//! Bounding-box overlay for preview frames.

use image::{Rgb, RgbImage};
use presence_core::FaceRegion;
use std::collections::BTreeSet;

const BOX_THICKNESS: u32 = 2;

/// What the loop knows about a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxState {
    Unknown,
    /// Identified but not yet recorded present.
    Detected,
    Marked,
}

impl BoxState {
    pub fn classify(identity: Option<i64>, marked: &BTreeSet<i64>) -> Self {
        match identity {
            None => BoxState::Unknown,
            Some(id) if marked.contains(&id) => BoxState::Marked,
            Some(_) => BoxState::Detected,
        }
    }

    pub fn color(&self) -> Rgb<u8> {
        match self {
            BoxState::Unknown => Rgb([255, 0, 0]),
            BoxState::Detected => Rgb([255, 165, 0]),
            BoxState::Marked => Rgb([0, 255, 0]),
        }
    }
}

/// Draw a hollow rectangle, clipped to the image.
pub fn draw_box(img: &mut RgbImage, region: &FaceRegion, color: Rgb<u8>) {
    let r = region.clamp_to(img.width(), img.height());
    if r.width() == 0 || r.height() == 0 {
        return;
    }
    let t = BOX_THICKNESS.min(r.width()).min(r.height());

    for y in r.top..r.bottom {
        for x in r.left..r.right {
            let edge = y < r.top + t || y >= r.bottom - t || x < r.left + t || x >= r.right - t;
            if edge {
                img.put_pixel(x, y, color);
            }
        }
    }
}

/// Copy of `frame` with one box per `(region, identity)`.
pub fn annotate(frame: &RgbImage, boxes: &[(FaceRegion, Option<i64>)], marked: &BTreeSet<i64>) -> RgbImage {
    let mut out = frame.clone();
    for (region, identity) in boxes {
        draw_box(&mut out, region, BoxState::classify(*identity, marked).color());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let marked: BTreeSet<i64> = [3].into_iter().collect();
        assert_eq!(BoxState::classify(None, &marked), BoxState::Unknown);
        assert_eq!(BoxState::classify(Some(4), &marked), BoxState::Detected);
        assert_eq!(BoxState::classify(Some(3), &marked), BoxState::Marked);
    }

    #[test]
    fn test_draw_box_outline_only() {
        let mut img = RgbImage::new(20, 20);
        let region = FaceRegion::from_rect(5, 5, 10, 10);
        draw_box(&mut img, &region, BoxState::Marked.color());

        assert_eq!(*img.get_pixel(5, 5), Rgb([0, 255, 0]));
        assert_eq!(*img.get_pixel(14, 14), Rgb([0, 255, 0]));
        assert_eq!(*img.get_pixel(6, 10), Rgb([0, 255, 0]));
        // Interior and outside untouched.
        assert_eq!(*img.get_pixel(10, 10), Rgb([0, 0, 0]));
        assert_eq!(*img.get_pixel(4, 4), Rgb([0, 0, 0]));
        assert_eq!(*img.get_pixel(15, 15), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_box_clipped() {
        let mut img = RgbImage::new(10, 10);
        draw_box(&mut img, &FaceRegion::from_rect(6, 6, 10, 10), BoxState::Unknown.color());
        assert_eq!(*img.get_pixel(6, 6), Rgb([255, 0, 0]));
        assert_eq!(*img.get_pixel(9, 9), Rgb([255, 0, 0]));
    }

    #[test]
    fn test_annotate_colors_by_state() {
        let frame = RgbImage::new(40, 20);
        let marked: BTreeSet<i64> = [1].into_iter().collect();
        let boxes = vec![
            (FaceRegion::from_rect(0, 0, 10, 10), Some(1)),
            (FaceRegion::from_rect(15, 0, 10, 10), Some(2)),
            (FaceRegion::from_rect(30, 0, 10, 10), None),
        ];
        let out = annotate(&frame, &boxes, &marked);
        assert_eq!(*out.get_pixel(0, 0), Rgb([0, 255, 0]));
        assert_eq!(*out.get_pixel(15, 0), Rgb([255, 165, 0]));
        assert_eq!(*out.get_pixel(30, 0), Rgb([255, 0, 0]));
        // Source frame is not modified.
        assert_eq!(*frame.get_pixel(0, 0), Rgb([0, 0, 0]));
    }
}
