//! Single-shot enrollment boundary: image bytes in, stored identity out.
//!
//! Nothing is written unless the photo decodes, contains exactly one face and
//! that face encodes. The known set is not touched here; callers reload it
//! explicitly (see [`crate::registry::reload_known_set`]).

use image::{ImageFormat, RgbImage};
use presence_core::{EncodeError, EnrollError, FaceRegion, FeatureExtractor};
use presence_store::{IdentityStore, NewStudent, StoreError};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Same-name photos tried before enrollment gives up.
const MAX_PHOTO_SUFFIX: u32 = 1000;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("first and last name must not be empty")]
    InvalidName,
    #[error("cannot decode image: {0}")]
    DecodeError(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{count} faces detected; exactly one required")]
    MultipleFacesDetected { count: usize },
    #[error("face region too small: {width}x{height}")]
    RegionTooSmall { width: u32, height: u32 },
    #[error("encoding failed: {0}")]
    EncodingFailure(String),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("saving photo: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EnrollError> for EnrollmentError {
    fn from(e: EnrollError) -> Self {
        match e {
            EnrollError::NoFaceDetected => EnrollmentError::NoFaceDetected,
            EnrollError::MultipleFacesDetected { count } => {
                EnrollmentError::MultipleFacesDetected { count }
            }
            EnrollError::Encode(EncodeError::RegionTooSmall { width, height }) => {
                EnrollmentError::RegionTooSmall { width, height }
            }
            EnrollError::Encode(EncodeError::EncodingFailure(msg)) => {
                EnrollmentError::EncodingFailure(msg)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrolledStudent {
    pub id: i64,
    pub vector_dimension: usize,
}

/// Result of validating a candidate photo without storing anything.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoCheck {
    pub region: FaceRegion,
    pub vector_dimension: usize,
}

pub(crate) fn decode_image(bytes: &[u8]) -> Result<RgbImage, EnrollmentError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| EnrollmentError::DecodeError(e.to_string()))
}

/// Would this photo enroll?
pub fn check_photo(extractor: &FeatureExtractor, bytes: &[u8]) -> Result<PhotoCheck, EnrollmentError> {
    let frame = decode_image(bytes)?;
    let enrollment = extractor.enroll(&frame)?;
    Ok(PhotoCheck {
        region: enrollment.region,
        vector_dimension: enrollment.vector.dimension(),
    })
}

/// Enroll a new student from one photo.
///
/// When `photo_dir` is set the decoded photo is kept there as
/// `<first>_<last>.jpg` (`<first>_<last>_<n>.jpg` when that name is taken)
/// and its path stored with the student. Existing photos are never replaced.
pub fn enroll_student(
    extractor: &FeatureExtractor,
    store: &dyn IdentityStore,
    photo_dir: Option<&Path>,
    bytes: &[u8],
    first_name: &str,
    last_name: &str,
) -> Result<EnrolledStudent, EnrollmentError> {
    let first_name = first_name.trim();
    let last_name = last_name.trim();
    if first_name.is_empty() || last_name.is_empty() {
        return Err(EnrollmentError::InvalidName);
    }

    let frame = decode_image(bytes)?;
    let enrollment = extractor.enroll(&frame)?;
    let vector_dimension = enrollment.vector.dimension();

    let photo_path = match photo_dir {
        Some(dir) => Some(save_photo(dir, &frame, first_name, last_name)?),
        None => None,
    };

    let student = NewStudent {
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
        photo_path: photo_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
        vector: enrollment.vector,
    };

    let id = match store.add_student(&student) {
        Ok(id) => id,
        Err(e) => {
            if let Some(path) = &photo_path {
                let _ = std::fs::remove_file(path);
            }
            return Err(e.into());
        }
    };

    tracing::info!(
        student_id = id,
        name = %format!("{first_name} {last_name}"),
        dim = vector_dimension,
        mode = %extractor.mode(),
        "student enrolled"
    );
    Ok(EnrolledStudent {
        id,
        vector_dimension,
    })
}

fn save_photo(
    dir: &Path,
    frame: &RgbImage,
    first_name: &str,
    last_name: &str,
) -> Result<PathBuf, EnrollmentError> {
    std::fs::create_dir_all(dir)?;
    let stem = format!("{}_{}", file_component(first_name), file_component(last_name));
    let (path, file) = create_unique(dir, &stem)?;

    let mut out = BufWriter::new(file);
    let written = frame
        .write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|e| match e {
            image::ImageError::IoError(io) => EnrollmentError::Io(io),
            other => EnrollmentError::EncodingFailure(other.to_string()),
        })
        .and_then(|()| out.flush().map_err(EnrollmentError::from));
    if let Err(e) = written {
        let _ = std::fs::remove_file(&path);
        return Err(e);
    }
    Ok(path)
}

/// Claim `<stem>.jpg`, else `<stem>_2.jpg`, `<stem>_3.jpg` and so on.
fn create_unique(dir: &Path, stem: &str) -> Result<(PathBuf, File), EnrollmentError> {
    for n in 1..=MAX_PHOTO_SUFFIX {
        let name = if n == 1 {
            format!("{stem}.jpg")
        } else {
            format!("{stem}_{n}.jpg")
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(EnrollmentError::Io(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free photo name for {stem}"),
    )))
}

/// Keep names usable as a single path component.
fn file_component(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
