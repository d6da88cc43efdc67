//! Face encoders: an ONNX embedding network, or a histogram + LBP fallback.
//!
//! The encoder is chosen once when the extractor is built and never changes
//! for the lifetime of the process.

use crate::types::{EncodingMode, FeatureVector};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
/// Regions narrower or shorter than this are rejected.
pub const MIN_REGION_SIZE: u32 = 20;
/// Side of the grayscale patch the fallback descriptor is computed on.
const PATCH_SIZE: u32 = 100;
const HISTOGRAM_BINS: usize = 256;
/// Fallback vector: intensity histogram followed by LBP histogram.
pub const HISTOGRAM_DIM: usize = HISTOGRAM_BINS * 2;
const HISTOGRAM_EPS: f32 = 1e-7;
/// OpenFace-style networks take a 96x96 RGB crop.
pub const DEFAULT_EMBEDDING_INPUT: usize = 96;
const PIXEL_SCALE: f32 = 1.0 / 255.0;

/// Errors loading the embedding network.
#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}; place the embedding model in the model directory")]
    ModelNotFound(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Errors encoding a single face region.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("face region too small: {width}x{height} (minimum {MIN_REGION_SIZE}x{MIN_REGION_SIZE})")]
    RegionTooSmall { width: u32, height: u32 },
    #[error("encoding failed: {0}")]
    EncodingFailure(String),
}

/// Pre-trained embedding network.
pub struct EmbeddingNet {
    session: Mutex<Session>,
    input_size: usize,
}

impl EmbeddingNet {
    /// Load an embedding model expecting `input_size`x`input_size` RGB input.
    pub fn load(model_path: &Path, input_size: usize) -> Result<Self, EncoderError> {
        if !model_path.exists() {
            return Err(EncoderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            input_size,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_size,
        })
    }

    fn embed(&self, crop: &RgbImage) -> Result<Vec<f32>, EncodeError> {
        let input = preprocess_rgb(crop, self.input_size);
        let tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| EncodeError::EncodingFailure(format!("input tensor: {e}")))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| EncodeError::EncodingFailure(format!("forward pass: {e}")))?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncodeError::EncodingFailure(format!("embedding extraction: {e}")))?;

        Ok(raw.to_vec())
    }
}

/// Resize an RGB crop to a square NCHW tensor scaled to [0, 1].
fn preprocess_rgb(crop: &RgbImage, size: usize) -> Array4<f32> {
    let resized = imageops::resize(crop, size as u32, size as u32, FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            tensor[[0, c, y, x]] = pixel[c] as f32 * PIXEL_SCALE;
        }
    }

    tensor
}

/// Active encoding strategy.
pub enum FaceEncoder {
    Embedding(EmbeddingNet),
    Histogram,
}

impl FaceEncoder {
    /// Use the embedding model when it exists and loads; otherwise fall back
    /// to the histogram descriptor.
    pub fn select(model_path: Option<&Path>, input_size: usize) -> Self {
        let Some(path) = model_path else {
            tracing::info!("no embedding model configured; using histogram encoder");
            return FaceEncoder::Histogram;
        };

        match EmbeddingNet::load(path, input_size) {
            Ok(net) => FaceEncoder::Embedding(net),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "embedding model unavailable; using histogram encoder"
                );
                FaceEncoder::Histogram
            }
        }
    }

    pub fn mode(&self) -> EncodingMode {
        match self {
            FaceEncoder::Embedding(_) => EncodingMode::Embedding,
            FaceEncoder::Histogram => EncodingMode::Histogram,
        }
    }

    /// Encode a cropped face.
    pub fn encode(&self, region: &RgbImage) -> Result<FeatureVector, EncodeError> {
        let (width, height) = region.dimensions();
        if width < MIN_REGION_SIZE || height < MIN_REGION_SIZE {
            return Err(EncodeError::RegionTooSmall { width, height });
        }

        let values = match self {
            FaceEncoder::Embedding(net) => net.embed(region)?,
            FaceEncoder::Histogram => histogram_descriptor(region),
        };

        if values.is_empty() {
            return Err(EncodeError::EncodingFailure("empty feature vector".into()));
        }
        if let Some(i) = values.iter().position(|v| !v.is_finite()) {
            return Err(EncodeError::EncodingFailure(format!(
                "non-finite value at index {i}"
            )));
        }

        Ok(FeatureVector::new(values, self.mode()))
    }
}

/// Intensity histogram and LBP histogram of a 100x100 grayscale patch.
fn histogram_descriptor(region: &RgbImage) -> Vec<f32> {
    let gray = imageops::grayscale(region);
    let patch = imageops::resize(&gray, PATCH_SIZE, PATCH_SIZE, FilterType::Triangle);

    let mut intensity = [0f32; HISTOGRAM_BINS];
    for p in patch.pixels() {
        intensity[p[0] as usize] += 1.0;
    }

    let mut texture = [0f32; HISTOGRAM_BINS];
    for y in 1..PATCH_SIZE - 1 {
        for x in 1..PATCH_SIZE - 1 {
            texture[lbp_code(&patch, x, y) as usize] += 1.0;
        }
    }

    let mut values = Vec::with_capacity(HISTOGRAM_DIM);
    values.extend(l1_normalize(&intensity));
    values.extend(l1_normalize(&texture));
    values
}

/// 8-bit local binary pattern at an interior pixel.
///
/// Neighbours are read clockwise from the top-left; the top-left neighbour
/// is the most significant bit. A bit is set when the neighbour is at least
/// as bright as the centre.
fn lbp_code(patch: &GrayImage, x: u32, y: u32) -> u8 {
    let center = patch.get_pixel(x, y)[0];
    let neighbours = [
        (x - 1, y - 1),
        (x, y - 1),
        (x + 1, y - 1),
        (x + 1, y),
        (x + 1, y + 1),
        (x, y + 1),
        (x - 1, y + 1),
        (x - 1, y),
    ];

    neighbours
        .iter()
        .fold(0u8, |code, &(nx, ny)| {
            (code << 1) | u8::from(patch.get_pixel(nx, ny)[0] >= center)
        })
}

fn l1_normalize(hist: &[f32; HISTOGRAM_BINS]) -> impl Iterator<Item = f32> + '_ {
    let total: f32 = hist.iter().sum::<f32>() + HISTOGRAM_EPS;
    hist.iter().map(move |v| v / total)
}
