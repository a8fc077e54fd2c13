//! facelogin-core — Face descriptor extraction and matching engine.
//!
//! Turns a detected face crop into a fixed-length normalized descriptor,
//! compares descriptors by Euclidean distance, and runs the registration
//! duplicate check and login best-match search over stored identities.

pub mod codec;
pub mod comparator;
pub mod detector;
pub mod extractor;
pub mod matcher;
pub mod types;

pub use detector::{FaceCapture, FaceLocator, FacePipeline, PipelineError};
pub use matcher::{EuclideanMatcher, Matcher};
pub use types::{
    Candidate, Descriptor, FaceRegion, GalleryEntry, MatchDecision, Thresholds, DESCRIPTOR_LEN,
};
