//! Face pipeline: decode an uploaded image, locate the largest face and crop it.
//!
//! The detection backend is loaded once at startup into a [`FacePipeline`]
//! handle. If loading fails the handle stays in an unavailable state and every
//! call fails fast until the process is restarted.

use crate::extractor::{self, ExtractError};
use crate::types::{Descriptor, FaceRegion};
use image::{imageops, DynamicImage, GrayImage};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Default SeetaFace model file name.
pub const DEFAULT_MODEL_FILE: &str = "seeta_fd_frontal_v1.0.bin";

// SeetaFace detector parameters.
const SEETA_SCORE_THRESHOLD: f64 = 2.0;
const SEETA_PYRAMID_SCALE: f32 = 0.8;
const SEETA_WINDOW_STEP: u32 = 4;
/// Smallest window the SeetaFace cascade accepts; `rustface` panics below it.
pub const SEETA_MIN_FACE_SIZE: u32 = 20;

const CROP_PREFIX: &str = "detected_face";

static CROP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("model file not found: {0} (download the SeetaFace frontal model)")]
    ModelNotFound(String),
    #[error("failed to load face model: {0}")]
    ModelLoad(String),
    #[error("minimum face size {0} is below the detector limit of {min}", min = SEETA_MIN_FACE_SIZE)]
    MinFaceSize(u32),
    #[error("face pipeline unavailable: {0}")]
    Unavailable(String),
    #[error("cannot decode image: {0}")]
    DecodeFailure(String),
    #[error("no face detected in the image")]
    NoFaceRegion,
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

/// Axis-aligned face rectangle in image pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBounds {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
    pub score: f64,
}

impl FaceBounds {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersect with a `width`×`height` image; `None` if nothing remains.
    fn clamp_to(&self, width: u32, height: u32) -> Option<FaceBounds> {
        let x0 = self.x.clamp(0, width as i64);
        let y0 = self.y.clamp(0, height as i64);
        let x1 = (self.x + self.width as i64).clamp(0, width as i64);
        let y1 = (self.y + self.height as i64).clamp(0, height as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(FaceBounds {
            x: x0,
            y: y0,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
            score: self.score,
        })
    }
}

/// Pluggable face localization backend.
pub trait FaceLocator: Send + Sync {
    /// Find faces in a row-major grayscale buffer of `width` × `height` bytes.
    fn locate(&self, gray: &[u8], width: u32, height: u32) -> Vec<FaceBounds>;
}

/// Face locator backed by the `rustface` SeetaFace engine.
pub struct RustfaceLocator {
    model: rustface::Model,
    min_face_size: u32,
}

impl RustfaceLocator {
    /// Load a SeetaFace model from disk.
    pub fn load(model_path: &Path, min_face_size: u32) -> Result<Self, PipelineError> {
        if min_face_size < SEETA_MIN_FACE_SIZE {
            return Err(PipelineError::MinFaceSize(min_face_size));
        }
        if !model_path.exists() {
            return Err(PipelineError::ModelNotFound(model_path.display().to_string()));
        }

        let file = File::open(model_path).map_err(|e| PipelineError::ModelLoad(e.to_string()))?;
        let model = rustface::read_model(BufReader::new(file))
            .map_err(|e| PipelineError::ModelLoad(e.to_string()))?;

        tracing::info!(path = %model_path.display(), min_face_size, "loaded SeetaFace model");

        Ok(Self {
            model,
            min_face_size,
        })
    }
}

impl FaceLocator for RustfaceLocator {
    fn locate(&self, gray: &[u8], width: u32, height: u32) -> Vec<FaceBounds> {
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(self.min_face_size);
        detector.set_score_thresh(SEETA_SCORE_THRESHOLD);
        detector.set_pyramid_scale_factor(SEETA_PYRAMID_SCALE);
        detector.set_slide_window_step(SEETA_WINDOW_STEP, SEETA_WINDOW_STEP);

        detector
            .detect(&rustface::ImageData::new(gray, width, height))
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                FaceBounds {
                    x: bbox.x() as i64,
                    y: bbox.y() as i64,
                    width: bbox.width(),
                    height: bbox.height(),
                    score: face.score(),
                }
            })
            .collect()
    }
}

/// Grayscale crop of the largest face plus its audit trail.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub region: FaceRegion,
    pub bounds: FaceBounds,
    /// Where the colour crop was saved, if audit crops are enabled.
    pub crop_path: Option<PathBuf>,
}

/// Descriptor extracted from an uploaded image.
#[derive(Debug, Clone)]
pub struct FaceCapture {
    pub descriptor: Descriptor,
    pub bounds: FaceBounds,
    pub crop_path: Option<PathBuf>,
}

enum Backend {
    Ready(Box<dyn FaceLocator>),
    Unavailable(String),
}

/// Explicitly initialized face detection capability.
pub struct FacePipeline {
    backend: Backend,
    crop_dir: Option<PathBuf>,
}

impl FacePipeline {
    /// Wrap an already constructed locator.
    pub fn new(locator: Box<dyn FaceLocator>, crop_dir: Option<PathBuf>) -> Self {
        Self {
            backend: Backend::Ready(locator),
            crop_dir,
        }
    }

    /// A pipeline whose backend failed to start.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            backend: Backend::Unavailable(reason.into()),
            crop_dir: None,
        }
    }

    /// Load the SeetaFace backend. Never fails: a load error leaves the
    /// pipeline unavailable and is reported by [`detect`](Self::detect).
    pub fn init(model_path: &Path, min_face_size: u32, crop_dir: Option<PathBuf>) -> Self {
        match RustfaceLocator::load(model_path, min_face_size) {
            Ok(locator) => Self::new(Box::new(locator), crop_dir),
            Err(e) => {
                tracing::error!(error = %e, "face pipeline failed to initialize");
                Self::unavailable(e.to_string())
            }
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.backend, Backend::Ready(_))
    }

    /// Reason the backend is unavailable, if it is.
    pub fn unavailable_reason(&self) -> Option<&str> {
        match &self.backend {
            Backend::Ready(_) => None,
            Backend::Unavailable(reason) => Some(reason),
        }
    }

    /// Decode `image_bytes`, pick the largest face and crop it.
    pub fn detect(&self, image_bytes: &[u8]) -> Result<DetectedFace, PipelineError> {
        let locator = match &self.backend {
            Backend::Ready(locator) => locator,
            Backend::Unavailable(reason) => return Err(PipelineError::Unavailable(reason.clone())),
        };

        let image = image::load_from_memory(image_bytes)
            .map_err(|e| PipelineError::DecodeFailure(e.to_string()))?;
        let gray = image.to_luma8();
        let (width, height) = gray.dimensions();

        let faces = locator.locate(gray.as_raw(), width, height);
        tracing::debug!(count = faces.len(), width, height, "faces located");

        let bounds = largest_face(&faces, width, height).ok_or(PipelineError::NoFaceRegion)?;
        let region = crop_region(&gray, &bounds);
        let crop_path = self.save_crop(&image, &bounds);

        tracing::info!(
            x = bounds.x,
            y = bounds.y,
            width = bounds.width,
            height = bounds.height,
            score = bounds.score,
            "face region selected"
        );

        Ok(DetectedFace {
            region,
            bounds,
            crop_path,
        })
    }

    /// Detect the largest face and extract its descriptor.
    pub fn capture(&self, image_bytes: &[u8]) -> Result<FaceCapture, PipelineError> {
        let face = self.detect(image_bytes)?;
        let descriptor = extractor::extract(&face.region)?;
        Ok(FaceCapture {
            descriptor,
            bounds: face.bounds,
            crop_path: face.crop_path,
        })
    }

    /// Save the colour crop for audit. Failures are logged, never fatal.
    fn save_crop(&self, image: &DynamicImage, bounds: &FaceBounds) -> Option<PathBuf> {
        let dir = self.crop_dir.as_ref()?;
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot create crop directory");
            return None;
        }

        // Sequence suffix keeps captures within the same millisecond apart.
        let file_name = format!(
            "{CROP_PREFIX}_{}_{}.jpg",
            chrono::Utc::now().timestamp_millis(),
            CROP_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let path = dir.join(file_name);
        let crop = image
            .crop_imm(bounds.x as u32, bounds.y as u32, bounds.width, bounds.height)
            .to_rgb8();

        match crop.save(&path) {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to save face crop");
                None
            }
        }
    }
}

/// Largest face by area, clamped to the image. Ties keep the earlier face.
fn largest_face(faces: &[FaceBounds], width: u32, height: u32) -> Option<FaceBounds> {
    faces
        .iter()
        .filter_map(|f| f.clamp_to(width, height))
        .fold(None, |best: Option<FaceBounds>, face| match best {
            Some(b) if b.area() >= face.area() => Some(b),
            _ => Some(face),
        })
}

fn crop_region(gray: &GrayImage, bounds: &FaceBounds) -> FaceRegion {
    let crop = imageops::crop_imm(
        gray,
        bounds.x as u32,
        bounds.y as u32,
        bounds.width,
        bounds.height,
    )
    .to_image();
    let (width, height) = crop.dimensions();
    FaceRegion::new(crop.into_raw(), width, height)
}
