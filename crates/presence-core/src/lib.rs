//! presence-core — Face detection, encoding and identification.
//!
//! Detection uses a boosted Haar-like cascade. Encoding runs an ONNX
//! embedding network when one is available and otherwise falls back to an
//! intensity + local-binary-pattern histogram descriptor.

pub mod cascade;
pub mod detector;
pub mod encoder;
pub mod extractor;
pub mod matcher;
pub mod types;

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;

pub use cascade::{Cascade, CascadeError};
pub use detector::{DetectorParams, FaceDetector};
pub use encoder::{EncodeError, EncoderError, FaceEncoder};
pub use extractor::{EnrollError, Enrollment, ExtractorConfig, FeatureExtractor, Recognition};
pub use matcher::{
    EuclideanMatcher, Identification, KnownSet, KnownSetCell, MatchError, Matcher,
    DEFAULT_MATCH_THRESHOLD, FALLBACK_THRESHOLD,
};
pub use types::{EncodingMode, FaceRegion, FeatureVector, KnownIdentity};
