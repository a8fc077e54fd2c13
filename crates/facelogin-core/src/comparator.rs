//! Euclidean distance between descriptors.
//!
//! Descriptors of different lengths are compared over their common prefix
//! instead of failing. One empty side yields [`MISMATCH_DISTANCE`], which no
//! threshold can accept.

use crate::types::Descriptor;

/// Distance reported when exactly one descriptor is empty.
pub const MISMATCH_DISTANCE: f64 = f64::INFINITY;

/// Euclidean distance over the first `min(a.len(), b.len())` components.
///
/// Never panics. Both empty gives 0.0; exactly one empty gives
/// [`MISMATCH_DISTANCE`].
pub fn distance(a: &Descriptor, b: &Descriptor) -> f64 {
    euclidean(a.values(), b.values())
}

pub fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() != b.is_empty() {
        return MISMATCH_DISTANCE;
    }
    if a.len() != b.len() {
        tracing::debug!(
            left = a.len(),
            right = b.len(),
            compared = a.len().min(b.len()),
            "descriptor length mismatch, comparing common prefix"
        );
    }

    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}
