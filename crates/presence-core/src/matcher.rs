//! Nearest-neighbour identification against an immutable known-identity snapshot.

use crate::types::{EncodingMode, FeatureVector, KnownIdentity};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// User-tunable default for embedding mode.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;
/// Fixed threshold for histogram vectors, which live on a different distance scale.
pub const FALLBACK_THRESHOLD: f32 = 0.4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("encoding mode mismatch: known set is {expected}, face is {actual}")]
    ModeMismatch {
        expected: EncodingMode,
        actual: EncodingMode,
    },
    #[error("dimension mismatch: known set is {expected}-dim, face is {actual}-dim")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Decision threshold for vectors of `mode`.
///
/// The configured value only applies to embedding vectors.
pub fn threshold_for(mode: EncodingMode, configured: f32) -> f32 {
    match mode {
        EncodingMode::Embedding => configured,
        EncodingMode::Histogram => FALLBACK_THRESHOLD,
    }
}

/// Immutable, ordered set of identities that share one encoding mode and dimension.
#[derive(Debug, Clone)]
pub struct KnownSet {
    mode: EncodingMode,
    dimension: Option<usize>,
    identities: Vec<KnownIdentity>,
}

impl KnownSet {
    pub fn empty(mode: EncodingMode) -> Self {
        Self {
            mode,
            dimension: None,
            identities: Vec::new(),
        }
    }

    /// Build a snapshot for `mode`, skipping identities that cannot be compared.
    ///
    /// The first accepted identity fixes the dimension. Returns the snapshot
    /// and the number of rejected identities.
    pub fn build(mode: EncodingMode, identities: Vec<KnownIdentity>) -> (Self, usize) {
        let mut set = Self::empty(mode);
        let mut rejected = 0;

        for identity in identities {
            if identity.vector.mode != mode {
                tracing::warn!(
                    id = identity.id,
                    name = %identity.display_name,
                    stored = %identity.vector.mode,
                    active = %mode,
                    "skipping identity encoded with another mode; re-encode to include it"
                );
                rejected += 1;
                continue;
            }
            if identity.vector.values.iter().any(|v| !v.is_finite()) {
                tracing::warn!(
                    id = identity.id,
                    name = %identity.display_name,
                    "skipping identity with a non-finite vector; re-encode to include it"
                );
                rejected += 1;
                continue;
            }
            let dim = identity.vector.dimension();
            match set.dimension {
                Some(expected) if expected != dim => {
                    tracing::warn!(
                        id = identity.id,
                        expected,
                        actual = dim,
                        "skipping identity with mismatched vector dimension"
                    );
                    rejected += 1;
                    continue;
                }
                None if dim == 0 => {
                    rejected += 1;
                    continue;
                }
                _ => {}
            }
            set.dimension = Some(dim);
            set.identities.push(identity);
        }

        (set, rejected)
    }

    pub fn mode(&self) -> EncodingMode {
        self.mode
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn identities(&self) -> &[KnownIdentity] {
        &self.identities
    }

    pub fn get(&self, id: i64) -> Option<&KnownIdentity> {
        self.identities.iter().find(|k| k.id == id)
    }
}

/// Shared handle whose snapshot is replaced wholesale on reload.
///
/// Readers clone the inner `Arc` and keep a consistent view for as long as
/// they hold it.
pub struct KnownSetCell {
    current: RwLock<Arc<KnownSet>>,
}

impl KnownSetCell {
    pub fn new(initial: KnownSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn snapshot(&self) -> Arc<KnownSet> {
        Arc::clone(&self.current.read())
    }

    /// Build a new snapshot in the current mode and swap it in.
    pub fn reload(&self, identities: Vec<KnownIdentity>) -> Arc<KnownSet> {
        let mode = self.current.read().mode();
        let (set, rejected) = KnownSet::build(mode, identities);
        let next = Arc::new(set);
        *self.current.write() = Arc::clone(&next);

        tracing::info!(
            mode = %mode,
            identities = next.len(),
            rejected,
            "known set reloaded"
        );

        next
    }
}

/// Outcome of identifying one face.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum Identification {
    Known {
        id: i64,
        display_name: String,
        distance: f32,
        confidence: f32,
    },
    Unknown,
}

impl Identification {
    /// Confidence in percent; zero for unknown faces.
    pub fn confidence(&self) -> f32 {
        match self {
            Identification::Known { confidence, .. } => *confidence,
            Identification::Unknown => 0.0,
        }
    }

    pub fn id(&self) -> Option<i64> {
        match self {
            Identification::Known { id, .. } => Some(*id),
            Identification::Unknown => None,
        }
    }
}

/// Strategy for deciding identity from a face vector.
pub trait Matcher {
    fn identify(
        &self,
        query: &FeatureVector,
        known: &KnownSet,
        threshold: f32,
    ) -> Result<Identification, MatchError>;
}

/// Minimum Euclidean distance; ties go to the earliest identity.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn identify(
        &self,
        query: &FeatureVector,
        known: &KnownSet,
        threshold: f32,
    ) -> Result<Identification, MatchError> {
        let Some(dimension) = known.dimension() else {
            return Ok(Identification::Unknown);
        };
        if query.mode != known.mode() {
            return Err(MatchError::ModeMismatch {
                expected: known.mode(),
                actual: query.mode,
            });
        }
        if query.dimension() != dimension {
            return Err(MatchError::DimensionMismatch {
                expected: dimension,
                actual: query.dimension(),
            });
        }

        let mut best: Option<(usize, f32)> = None;
        for (i, identity) in known.identities().iter().enumerate() {
            let d = query.euclidean_distance(&identity.vector);
            if best.map_or(true, |(_, best_d)| d < best_d) {
                best = Some((i, d));
            }
        }

        match best {
            Some((idx, distance)) if distance < threshold => {
                let identity = &known.identities()[idx];
                Ok(Identification::Known {
                    id: identity.id,
                    display_name: identity.display_name.clone(),
                    distance,
                    confidence: confidence(distance, threshold),
                })
            }
            _ => Ok(Identification::Unknown),
        }
    }
}

/// `(1 - distance / threshold) * 100`, floored at 0 and rounded to one decimal.
fn confidence(distance: f32, threshold: f32) -> f32 {
    let raw = ((1.0 - distance / threshold) * 100.0).max(0.0);
    (raw * 10.0).round() / 10.0
}
