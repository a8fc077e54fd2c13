//! Descriptor extraction from a grayscale face crop.
//!
//! The crop is resampled to a 100×100 canonical image and summarized by four
//! feature blocks, concatenated in this order:
//!
//! | block       | values | content                                       |
//! |-------------|--------|-----------------------------------------------|
//! | statistical | 4      | mean, std dev, min, max intensity             |
//! | histogram   | 32     | min-max normalized 32-bin intensity histogram |
//! | grid        | 16     | mean intensity of each cell of a 4×4 grid     |
//! | texture     | 2      | mean and std dev of Sobel gradient magnitude  |
//!
//! The concatenation is truncated or zero-padded to [`DESCRIPTOR_LEN`] and
//! L2-normalized.

use crate::types::{Descriptor, FaceRegion, DESCRIPTOR_LEN};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::{s, Array2};
use thiserror::Error;

// --- Named constants ---
const CANONICAL_SIZE: u32 = 100;
const HISTOGRAM_BINS: usize = 32;
const HISTOGRAM_RANGE: f64 = 256.0;
const GRID_SIZE: usize = 4;
const NORMALIZE_EPSILON: f64 = f64::EPSILON;

#[derive(Error, Debug, PartialEq)]
pub enum ExtractError {
    #[error("invalid face region: {width}x{height} with {len} bytes")]
    InvalidInput { width: u32, height: u32, len: usize },
}

/// Turn a detected face region into a fixed-length descriptor.
pub fn extract(region: &FaceRegion) -> Result<Descriptor, ExtractError> {
    let canonical = canonicalize(region)?;

    let mut features = Vec::with_capacity(DESCRIPTOR_LEN);
    features.extend(statistical_block(&canonical));
    features.extend(histogram_block(&canonical));
    features.extend(grid_block(&canonical));
    features.extend(texture_block(&canonical));
    let raw_len = features.len();

    let values = l2_normalize(fit_to_length(features, DESCRIPTOR_LEN));

    tracing::debug!(
        width = region.width,
        height = region.height,
        raw_len,
        len = values.len(),
        "descriptor extracted"
    );

    Ok(Descriptor::new(values))
}

/// Validate the region and resample it to the canonical size.
fn canonicalize(region: &FaceRegion) -> Result<Array2<f64>, ExtractError> {
    let invalid = || ExtractError::InvalidInput {
        width: region.width,
        height: region.height,
        len: region.data.len(),
    };

    let expected = region.width as usize * region.height as usize;
    if expected == 0 || region.data.len() != expected {
        return Err(invalid());
    }

    let gray = GrayImage::from_raw(region.width, region.height, region.data.clone())
        .ok_or_else(invalid)?;
    let resized = imageops::resize(&gray, CANONICAL_SIZE, CANONICAL_SIZE, FilterType::Triangle);

    let size = CANONICAL_SIZE as usize;
    Ok(Array2::from_shape_fn((size, size), |(y, x)| {
        resized.get_pixel(x as u32, y as u32).0[0] as f64
    }))
}

/// Mean, population standard deviation, minimum and maximum.
fn statistical_block(image: &Array2<f64>) -> Vec<f64> {
    let mean = image.mean().unwrap_or(0.0);
    let std_dev = image.std(0.0);
    let min = image.iter().copied().fold(f64::INFINITY, f64::min);
    let max = image.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    vec![mean, std_dev, min, max]
}

/// 32-bin histogram over [0, 256), bin counts min-max scaled to [0, 1].
fn histogram_block(image: &Array2<f64>) -> Vec<f64> {
    let bin_width = HISTOGRAM_RANGE / HISTOGRAM_BINS as f64;
    let mut counts = vec![0.0f64; HISTOGRAM_BINS];
    for &pixel in image.iter() {
        let bin = ((pixel / bin_width) as usize).min(HISTOGRAM_BINS - 1);
        counts[bin] += 1.0;
    }

    let lo = counts.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = counts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = hi - lo;
    // A flat histogram collapses to zeros rather than dividing by zero.
    let scale = if range > NORMALIZE_EPSILON { 1.0 / range } else { 0.0 };

    counts.iter().map(|c| (c - lo) * scale).collect()
}

/// Mean intensity of each cell of a 4×4 grid, row-major.
///
/// Cells are `rows / 4` by `cols / 4`; the last row and column of cells
/// absorb the remainder.
fn grid_block(image: &Array2<f64>) -> Vec<f64> {
    let (rows, cols) = image.dim();
    let cell_h = rows / GRID_SIZE;
    let cell_w = cols / GRID_SIZE;

    let mut features = Vec::with_capacity(GRID_SIZE * GRID_SIZE);
    for row in 0..GRID_SIZE {
        let y0 = row * cell_h;
        let y1 = if row == GRID_SIZE - 1 { rows } else { y0 + cell_h };
        for col in 0..GRID_SIZE {
            let x0 = col * cell_w;
            let x1 = if col == GRID_SIZE - 1 { cols } else { x0 + cell_w };
            let cell = image.slice(s![y0..y1, x0..x1]);
            features.push(cell.mean().unwrap_or(0.0));
        }
    }
    features
}

/// Mean and population standard deviation of the Sobel gradient magnitude.
fn texture_block(image: &Array2<f64>) -> Vec<f64> {
    let magnitude = gradient_magnitude(image);
    vec![magnitude.mean().unwrap_or(0.0), magnitude.std(0.0)]
}

/// Per-pixel `sqrt(gx² + gy²)` from 3×3 Sobel kernels.
///
/// Borders are reflected without repeating the edge pixel
/// (`gfedcb|abcdefgh|gfedcba`).
fn gradient_magnitude(image: &Array2<f64>) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let at = |y: isize, x: isize| image[[reflect_101(y, rows), reflect_101(x, cols)]];

    Array2::from_shape_fn((rows, cols), |(y, x)| {
        let (y, x) = (y as isize, x as isize);
        let gx = (at(y - 1, x + 1) + 2.0 * at(y, x + 1) + at(y + 1, x + 1))
            - (at(y - 1, x - 1) + 2.0 * at(y, x - 1) + at(y + 1, x - 1));
        let gy = (at(y + 1, x - 1) + 2.0 * at(y + 1, x) + at(y + 1, x + 1))
            - (at(y - 1, x - 1) + 2.0 * at(y - 1, x) + at(y - 1, x + 1));
        (gx * gx + gy * gy).sqrt()
    })
}

fn reflect_101(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let last = len as isize - 1;
    let mut i = index;
    if i < 0 {
        i = -i;
    }
    if i > last {
        i = 2 * last - i;
    }
    i.clamp(0, last) as usize
}

/// Truncate to `len` values or right-pad with zeros.
fn fit_to_length(mut features: Vec<f64>, len: usize) -> Vec<f64> {
    features.resize(len, 0.0);
    features
}

/// Scale to unit Euclidean norm; an all-zero vector is returned unchanged.
fn l2_normalize(values: Vec<f64>) -> Vec<f64> {
    let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        values.into_iter().map(|v| v / norm).collect()
    } else {
        values
    }
}
