use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Face bounding box in frame pixel coordinates.
///
/// `right` and `bottom` are exclusive, so `right - left` is the width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl FaceRegion {
    /// Build a region from an `(x, y, width, height)` rectangle.
    pub fn from_rect(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            top: y,
            right: x + width,
            bottom: y + height,
            left: x,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Clip the region to a `width` x `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let left = self.left.min(width);
        let top = self.top.min(height);
        Self {
            top,
            right: self.right.clamp(left, width),
            bottom: self.bottom.clamp(top, height),
            left,
        }
    }
}

/// Which encoder produced a feature vector.
///
/// Vectors from different modes live on different distance scales and must
/// never be compared with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingMode {
    /// Forward pass of a pre-trained embedding network.
    Embedding,
    /// Intensity histogram concatenated with an LBP texture histogram.
    Histogram,
}

impl EncodingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncodingMode::Embedding => "embedding",
            EncodingMode::Histogram => "histogram",
        }
    }
}

impl fmt::Display for EncodingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncodingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embedding" => Ok(EncodingMode::Embedding),
            "histogram" => Ok(EncodingMode::Histogram),
            other => Err(format!("unknown encoding mode: {other}")),
        }
    }
}

/// Fixed-length face descriptor tagged with the mode that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub values: Vec<f32>,
    pub mode: EncodingMode,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>, mode: EncodingMode) -> Self {
        Self { values, mode }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance to `other`. Callers check mode and dimension first.
    pub fn euclidean_distance(&self, other: &FeatureVector) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A registered person as seen by the matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownIdentity {
    pub id: i64,
    pub display_name: String,
    pub vector: FeatureVector,
}
