//! Multi-scale sliding-window face detector.
//!
//! Scans the frame with a boosted cascade at geometrically growing window
//! sizes, then merges overlapping hits into one region per face. Output is
//! deterministic: the same frame always yields the same regions in the same
//! order (top-to-bottom, then left-to-right).

use crate::cascade::{Cascade, CascadeError, IntegralImage};
use crate::types::FaceRegion;
use image::GrayImage;
use serde::{Deserialize, Serialize};

// --- Named constants ---
const DEFAULT_SCALE_FACTOR: f64 = 1.1;
const DEFAULT_MIN_NEIGHBORS: u32 = 5;
const DEFAULT_MIN_SIZE: u32 = 30;
/// Relative edge tolerance when merging candidate rectangles.
const GROUP_EPS: f64 = 0.2;

/// Scan parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorParams {
    /// Window growth per pass; must be greater than 1.
    pub scale_factor: f64,
    /// A face needs more than this many overlapping hits. Zero disables grouping.
    pub min_neighbors: u32,
    /// Smallest window (width, height) considered.
    pub min_size: (u32, u32),
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: (DEFAULT_MIN_SIZE, DEFAULT_MIN_SIZE),
        }
    }
}

/// Cascade-based face detector.
#[derive(Debug, Clone)]
pub struct FaceDetector {
    cascade: Cascade,
    params: DetectorParams,
}

impl FaceDetector {
    pub fn new(cascade: Cascade, params: DetectorParams) -> Result<Self, CascadeError> {
        cascade.validate()?;
        if !(params.scale_factor > 1.0) || !params.scale_factor.is_finite() {
            return Err(CascadeError::Invalid(format!(
                "scale factor must be greater than 1, got {}",
                params.scale_factor
            )));
        }
        Ok(Self { cascade, params })
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Locate faces in a grayscale frame.
    ///
    /// Returns an empty list when nothing survives grouping.
    pub fn detect(&self, gray: &GrayImage) -> Vec<FaceRegion> {
        let (width, height) = gray.dimensions();
        let candidates = self.scan(gray);

        tracing::trace!(width, height, candidates = candidates.len(), "cascade scan");

        let grouped = if self.params.min_neighbors == 0 {
            let mut raw = candidates;
            sort_rects(&mut raw);
            raw
        } else {
            group_rectangles(&candidates, self.params.min_neighbors, GROUP_EPS)
        };

        grouped
            .into_iter()
            .map(|r| FaceRegion::from_rect(r.x as u32, r.y as u32, r.w as u32, r.h as u32))
            .collect()
    }

    /// Collect every window accepted by the cascade, ordered by scale, row, column.
    fn scan(&self, gray: &GrayImage) -> Vec<Rect> {
        let (width, height) = gray.dimensions();
        let integral = IntegralImage::new(gray);
        let (min_w, min_h) = self.params.min_size;
        let mut candidates = Vec::new();

        let mut scale = 1.0f64;
        loop {
            let window_w = (self.cascade.width as f64 * scale).round() as u32;
            let window_h = (self.cascade.height as f64 * scale).round() as u32;
            if window_w > width || window_h > height {
                break;
            }

            if window_w >= min_w && window_h >= min_h {
                // Dense steps at small scales, one window-unit above 2x.
                let stride = if scale > 2.0 { 1.0 } else { 2.0 };
                let step = ((scale * stride).round() as u32).max(1);
                let scaled = self.cascade.scaled(scale, window_w, window_h);

                let mut y = 0;
                while y + window_h <= height {
                    let mut x = 0;
                    while x + window_w <= width {
                        if scaled.accepts(&integral, x, y) {
                            candidates.push(Rect {
                                x: x as i64,
                                y: y as i64,
                                w: window_w as i64,
                                h: window_h as i64,
                            });
                        }
                        x += step;
                    }
                    y += step;
                }
            }

            scale *= self.params.scale_factor;
        }

        candidates
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x: i64,
    y: i64,
    w: i64,
    h: i64,
}

fn sort_rects(rects: &mut [Rect]) {
    rects.sort_by_key(|r| (r.y, r.x, r.w));
}

/// Two candidates belong to the same face when every edge is within
/// `eps` of the mean of their smaller sides.
fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * ((a.w.min(b.w) + a.h.min(b.h)) as f64) * 0.5;
    ((a.x - b.x).abs() as f64) <= delta
        && ((a.y - b.y).abs() as f64) <= delta
        && ((a.x + a.w - b.x - b.w).abs() as f64) <= delta
        && ((a.y + a.h - b.y - b.h).abs() as f64) <= delta
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn round_div(sum: i64, n: i64) -> i64 {
    (sum as f64 / n as f64).round() as i64
}

/// Merge overlapping candidates, drop weak clusters and clusters nested in
/// stronger ones.
fn group_rectangles(rects: &[Rect], min_neighbors: u32, eps: f64) -> Vec<Rect> {
    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();

    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let a = find(&mut parent, i);
                let b = find(&mut parent, j);
                if a != b {
                    parent[a.max(b)] = a.min(b);
                }
            }
        }
    }

    // Clusters keyed by root; roots are visited in ascending order.
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        let root = find(&mut parent, i);
        members[root].push(i);
    }

    let averaged: Vec<(Rect, i64)> = members
        .iter()
        .filter(|m| !m.is_empty())
        .map(|m| {
            let count = m.len() as i64;
            let (mut sx, mut sy, mut sw, mut sh) = (0i64, 0i64, 0i64, 0i64);
            for &i in m {
                sx += rects[i].x;
                sy += rects[i].y;
                sw += rects[i].w;
                sh += rects[i].h;
            }
            let rect = Rect {
                x: round_div(sx, count),
                y: round_div(sy, count),
                w: round_div(sw, count),
                h: round_div(sh, count),
            };
            (rect, count)
        })
        .collect();

    let min_count = min_neighbors as i64;
    let mut out = Vec::new();
    for (i, (r1, n1)) in averaged.iter().enumerate() {
        if *n1 <= min_count {
            continue;
        }
        let nested = averaged.iter().enumerate().any(|(j, (r2, n2))| {
            if i == j || *n2 <= min_count {
                return false;
            }
            let dx = (r2.w as f64 * eps).round() as i64;
            let dy = (r2.h as f64 * eps).round() as i64;
            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.w <= r2.x + r2.w + dx
                && r1.y + r1.h <= r2.y + r2.h + dy
                && (*n2 > (*n1).max(3) || *n1 < 3)
        });
        if !nested {
            out.push(*r1);
        }
    }

    sort_rects(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, FIXTURE_FRAME_HEIGHT, FIXTURE_FRAME_WIDTH};

    fn detector() -> FaceDetector {
        FaceDetector::new(fixtures::fixture_cascade(), fixtures::fixture_params()).unwrap()
    }

    fn gray_frame(faces: &[(u32, u32, u32)]) -> GrayImage {
        image::imageops::grayscale(&fixtures::frame_with_faces(
            FIXTURE_FRAME_WIDTH,
            FIXTURE_FRAME_HEIGHT,
            faces,
        ))
    }

    fn rect(x: i64, y: i64, w: i64, h: i64) -> Rect {
        Rect { x, y, w, h }
    }

    #[test]
    fn test_blank_frame_has_no_faces() {
        assert!(detector().detect(&gray_frame(&[])).is_empty());
    }

    #[test]
    fn test_single_face_region() {
        let regions = detector().detect(&gray_frame(&[(40, 30, 48)]));
        assert_eq!(regions, vec![FaceRegion::from_rect(39, 29, 49, 49)]);
    }

    #[test]
    fn test_detect_is_deterministic() {
        let det = detector();
        let frame = gray_frame(&[(50, 20, 60)]);
        let first = det.detect(&frame);
        let second = det.detect(&frame);
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn test_two_faces_sorted_top_down() {
        let regions = detector().detect(&gray_frame(&[(8, 30, 48), (96, 30, 48)]));
        assert_eq!(
            regions,
            vec![
                FaceRegion::from_rect(95, 29, 49, 49),
                FaceRegion::from_rect(7, 30, 48, 48),
            ]
        );
    }

    #[test]
    fn test_faces_at_several_sizes() {
        for face in [(60, 40, 30), (10, 10, 36), (100, 50, 40)] {
            let regions = detector().detect(&gray_frame(&[face]));
            assert_eq!(regions.len(), 1, "face {face:?} gave {regions:?}");
            let r = regions[0];
            let (fx, fy, fs) = face;
            assert!(r.left.abs_diff(fx) <= 2 && r.top.abs_diff(fy) <= 2, "{r:?}");
            assert!(r.width().abs_diff(fs) <= 4, "{r:?}");
        }
    }

    #[test]
    fn test_min_neighbors_zero_returns_raw_hits() {
        let params = DetectorParams { min_neighbors: 0, ..fixtures::fixture_params() };
        let det = FaceDetector::new(fixtures::fixture_cascade(), params).unwrap();
        let regions = det.detect(&gray_frame(&[(40, 30, 48)]));
        assert_eq!(regions.len(), 17);
    }

    #[test]
    fn test_min_size_larger_than_face() {
        let params = DetectorParams { min_size: (60, 60), ..fixtures::fixture_params() };
        let det = FaceDetector::new(fixtures::fixture_cascade(), params).unwrap();
        assert!(det.detect(&gray_frame(&[(40, 30, 48)])).is_empty());
    }

    #[test]
    fn test_frame_smaller_than_window() {
        let tiny = GrayImage::new(10, 10);
        assert!(detector().detect(&tiny).is_empty());
    }

    #[test]
    fn test_rejects_scale_factor_of_one() {
        let params = DetectorParams { scale_factor: 1.0, ..DetectorParams::default() };
        assert!(FaceDetector::new(fixtures::fixture_cascade(), params).is_err());
    }

    #[test]
    fn test_similar_rects() {
        let a = rect(0, 0, 50, 50);
        // delta = 0.2 * (50 + 50) * 0.5 = 10
        assert!(similar(&a, &rect(10, 10, 50, 50), 0.2));
        assert!(!similar(&a, &rect(11, 0, 50, 50), 0.2));
    }

    #[test]
    fn test_group_drops_weak_clusters() {
        let rects = vec![rect(0, 0, 40, 40), rect(1, 1, 40, 40), rect(100, 100, 40, 40)];
        let grouped = group_rectangles(&rects, 1, 0.2);
        assert_eq!(grouped, vec![rect(1, 1, 40, 40)]);
    }

    #[test]
    fn test_group_averages_members() {
        let rects = vec![rect(10, 10, 40, 40), rect(12, 12, 42, 42), rect(14, 14, 44, 44)];
        let grouped = group_rectangles(&rects, 2, 0.2);
        assert_eq!(grouped, vec![rect(12, 12, 42, 42)]);
    }

    #[test]
    fn test_group_removes_nested_cluster() {
        let mut rects = Vec::new();
        // Strong outer cluster of five hits.
        for _ in 0..5 {
            rects.push(rect(0, 0, 100, 100));
        }
        // Weaker inner cluster, fully inside the outer one.
        for _ in 0..2 {
            rects.push(rect(30, 30, 40, 40));
        }
        let grouped = group_rectangles(&rects, 1, 0.2);
        assert_eq!(grouped, vec![rect(0, 0, 100, 100)]);
    }
}
