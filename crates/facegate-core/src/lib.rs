//! facegate-core — Face encodings and identity matching.
//!
//! Holds the shared employee/encoding types, the identity matcher that
//! resolves a query embedding to an employee, and the SCRFD + ArcFace
//! extraction pipeline running via ONNX Runtime for CPU inference.

pub mod alignment;
pub mod detector;
pub mod error;
pub mod extractor;
pub mod matcher;
pub mod types;

use std::path::PathBuf;

pub use error::ValidationError;
pub use detector::{FaceBox, FaceDetector};
pub use extractor::{ArcFaceExtractor, EncodingExtractor, ExtractionError};
pub use matcher::{
    Candidate, DistanceMetric, IdentityMatcher, Identification, Match, MatchPolicy,
};
pub use types::{Embedding, EmployeeId, EncodingId, FaceEncoding, ImageRef};

/// System-wide model directory used when none is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/facegate/models")
}
