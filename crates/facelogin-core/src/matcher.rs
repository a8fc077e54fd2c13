//! Registration duplicate check and login best-match search.
//!
//! Both sweeps visit every gallery entry. Entries without a usable stored
//! descriptor are filtered out before the reduction, so a corrupt record can
//! never match and never aborts the sweep.

use crate::comparator;
use crate::types::{Candidate, Descriptor, GalleryEntry, MatchDecision};

/// Strategy for comparing a descriptor against a gallery of registered faces.
pub trait Matcher {
    /// Reject `descriptor` if any stored face is closer than `threshold`.
    ///
    /// Returns [`MatchDecision::DuplicateRejected`] naming the first
    /// conflicting entry in gallery order, or [`MatchDecision::NoMatch`].
    fn check_duplicate(
        &self,
        descriptor: &Descriptor,
        gallery: &[GalleryEntry],
        threshold: f64,
    ) -> MatchDecision;

    /// Find the closest stored face strictly under `threshold`.
    ///
    /// Returns [`MatchDecision::BestMatch`] or [`MatchDecision::NoMatch`].
    fn best_match(
        &self,
        probe: &Descriptor,
        gallery: &[GalleryEntry],
        threshold: f64,
    ) -> MatchDecision;
}

/// Euclidean-distance matcher.
pub struct EuclideanMatcher;

impl EuclideanMatcher {
    fn distances<'a>(
        probe: &'a Descriptor,
        gallery: &'a [GalleryEntry],
    ) -> impl Iterator<Item = Candidate> + 'a {
        gallery
            .iter()
            .filter_map(|entry| match entry.comparable() {
                Some(stored) => Some((entry, stored)),
                None => {
                    tracing::debug!(id = entry.id, label = %entry.label, "skipping entry without descriptor");
                    None
                }
            })
            .map(|(entry, stored)| {
                let distance = comparator::distance(probe, stored);
                tracing::debug!(id = entry.id, label = %entry.label, distance, "compared");
                Candidate {
                    id: entry.id,
                    label: entry.label.clone(),
                    distance,
                }
            })
    }
}

impl Matcher for EuclideanMatcher {
    fn check_duplicate(
        &self,
        descriptor: &Descriptor,
        gallery: &[GalleryEntry],
        threshold: f64,
    ) -> MatchDecision {
        if gallery.is_empty() {
            tracing::info!("no registered faces, duplicate check passes");
            return MatchDecision::NoMatch;
        }

        // No early exit: every entry is compared regardless of position.
        let conflict = Self::distances(descriptor, gallery)
            .fold(None, |first: Option<Candidate>, candidate| {
                first.or((candidate.distance < threshold).then_some(candidate))
            });

        match conflict {
            Some(candidate) => {
                tracing::info!(
                    id = candidate.id,
                    label = %candidate.label,
                    distance = candidate.distance,
                    threshold,
                    "duplicate face rejected"
                );
                MatchDecision::DuplicateRejected(candidate)
            }
            None => {
                tracing::info!(entries = gallery.len(), threshold, "no duplicate face found");
                MatchDecision::NoMatch
            }
        }
    }

    fn best_match(
        &self,
        probe: &Descriptor,
        gallery: &[GalleryEntry],
        threshold: f64,
    ) -> MatchDecision {
        if gallery.is_empty() {
            tracing::info!("no registered faces, nothing to match");
            return MatchDecision::NoMatch;
        }

        // Strict less-than on both bounds: ties keep the earlier entry.
        let best = Self::distances(probe, gallery)
            .fold(None, |best: Option<Candidate>, candidate| {
                let improves = candidate.distance < threshold
                    && best.as_ref().map_or(true, |b| candidate.distance < b.distance);
                if improves {
                    Some(candidate)
                } else {
                    best
                }
            });

        match best {
            Some(candidate) => {
                tracing::info!(
                    id = candidate.id,
                    label = %candidate.label,
                    distance = candidate.distance,
                    threshold,
                    "best match found"
                );
                MatchDecision::BestMatch(candidate)
            }
            None => {
                tracing::info!(entries = gallery.len(), threshold, "no match under threshold");
                MatchDecision::NoMatch
            }
        }
    }
}
