//! Feature Extractor: frame in, (region, vector) pairs out.

use crate::cascade::{Cascade, CascadeError};
use crate::detector::{DetectorParams, FaceDetector};
use crate::encoder::{EncodeError, FaceEncoder};
use crate::matcher::{threshold_for, Identification, KnownSet, MatchError, Matcher};
use crate::types::{EncodingMode, FaceRegion, FeatureVector};
use image::{imageops, RgbImage};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("multiple faces detected ({count}); enrollment needs exactly one")]
    MultipleFacesDetected { count: usize },
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Where the extractor loads its models from.
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub cascade_path: PathBuf,
    /// Embedding network; `None` or a failed load selects histogram mode.
    pub embedding_model: Option<PathBuf>,
    pub embedding_input_size: usize,
    pub detector: DetectorParams,
    /// Threshold used in embedding mode.
    pub match_threshold: f32,
}

/// The single face found by enrollment.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub region: FaceRegion,
    pub vector: FeatureVector,
}

/// One identified face in a frame.
#[derive(Debug, Clone, Serialize)]
pub struct Recognition {
    pub region: FaceRegion,
    pub identification: Identification,
}

/// Detector plus the encoder selected at startup.
pub struct FeatureExtractor {
    detector: FaceDetector,
    encoder: FaceEncoder,
    configured_threshold: f32,
}

impl FeatureExtractor {
    pub fn new(detector: FaceDetector, encoder: FaceEncoder, configured_threshold: f32) -> Self {
        Self {
            detector,
            encoder,
            configured_threshold,
        }
    }

    /// Load the cascade (required) and the embedding model (optional).
    pub fn load(config: &ExtractorConfig) -> Result<Self, CascadeError> {
        let cascade = Cascade::load(&config.cascade_path)?;
        let detector = FaceDetector::new(cascade, config.detector)?;
        let encoder = FaceEncoder::select(
            config.embedding_model.as_deref(),
            config.embedding_input_size,
        );

        let extractor = Self::new(detector, encoder, config.match_threshold);
        tracing::info!(
            mode = %extractor.mode(),
            threshold = extractor.match_threshold(),
            "feature extractor ready"
        );
        Ok(extractor)
    }

    pub fn mode(&self) -> EncodingMode {
        self.encoder.mode()
    }

    /// Threshold the matcher must use for vectors from this extractor.
    pub fn match_threshold(&self) -> f32 {
        threshold_for(self.mode(), self.configured_threshold)
    }

    /// An empty snapshot in this extractor's mode.
    pub fn empty_known_set(&self) -> KnownSet {
        KnownSet::empty(self.mode())
    }

    pub fn detect_faces(&self, frame: &RgbImage) -> Vec<FaceRegion> {
        let gray = imageops::grayscale(frame);
        self.detector.detect(&gray)
    }

    /// Encode an already-cropped face image.
    pub fn encode_face(&self, region_image: &RgbImage) -> Result<FeatureVector, EncodeError> {
        self.encoder.encode(region_image)
    }

    /// Crop `region` out of `frame` and encode it.
    pub fn encode_region(
        &self,
        frame: &RgbImage,
        region: &FaceRegion,
    ) -> Result<FeatureVector, EncodeError> {
        let r = region.clamp_to(frame.width(), frame.height());
        let crop = imageops::crop_imm(frame, r.left, r.top, r.width(), r.height()).to_image();
        self.encode_face(&crop)
    }

    /// Single-shot enrollment: exactly one face, fully encoded, or an error.
    pub fn enroll(&self, frame: &RgbImage) -> Result<Enrollment, EnrollError> {
        let regions = self.detect_faces(frame);
        let region = match regions.as_slice() {
            [] => return Err(EnrollError::NoFaceDetected),
            [only] => *only,
            many => {
                return Err(EnrollError::MultipleFacesDetected { count: many.len() })
            }
        };

        let vector = self.encode_region(frame, &region)?;
        tracing::debug!(?region, dim = vector.dimension(), "enrollment face encoded");
        Ok(Enrollment { region, vector })
    }

    /// Detect, encode and identify every face in a still frame.
    ///
    /// Faces that fail to encode are skipped.
    pub fn recognize(
        &self,
        frame: &RgbImage,
        known: &KnownSet,
        matcher: &dyn Matcher,
    ) -> Result<Vec<Recognition>, MatchError> {
        let threshold = self.match_threshold();
        let mut out = Vec::new();

        for region in self.detect_faces(frame) {
            let vector = match self.encode_region(frame, &region) {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!(?region, error = %e, "skipping face");
                    continue;
                }
            };
            let identification = matcher.identify(&vector, known, threshold)?;
            out.push(Recognition {
                region,
                identification,
            });
        }

        Ok(out)
    }
}
