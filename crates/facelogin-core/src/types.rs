use serde::{Deserialize, Serialize};

/// Fixed descriptor length produced by extraction.
pub const DESCRIPTOR_LEN: usize = 256;

/// Face descriptor: an L2-normalized feature vector.
///
/// Extraction always yields [`DESCRIPTOR_LEN`] values with unit norm (or all
/// zeros for a degenerate region). Decoded descriptors keep whatever length
/// the stored text had.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    values: Vec<f64>,
}

impl Descriptor {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean norm of the vector.
    pub fn norm(&self) -> f64 {
        self.values.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    /// Euclidean distance to `other`; see [`crate::comparator::distance`].
    pub fn distance(&self, other: &Descriptor) -> f64 {
        crate::comparator::distance(self, other)
    }
}

/// Grayscale face crop handed to the extractor.
#[derive(Debug, Clone)]
pub struct FaceRegion {
    /// Row-major 8-bit luma, `width * height` bytes.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
        }
    }
}

/// One registered identity as seen by the matcher.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub id: i64,
    /// Human-readable name used in logs and decisions (the username).
    pub label: String,
    /// `None` when the identity has no usable stored descriptor.
    pub descriptor: Option<Descriptor>,
}

impl GalleryEntry {
    /// The stored descriptor, if it can take part in a comparison.
    pub fn comparable(&self) -> Option<&Descriptor> {
        self.descriptor.as_ref().filter(|d| !d.is_empty())
    }
}

/// Identity picked by a matching sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub id: i64,
    pub label: String,
    pub distance: f64,
}

/// Outcome of a registration duplicate check or a login search.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    /// Registration rejected: the face is too close to this identity.
    DuplicateRejected(Candidate),
    /// Login accepted for this identity.
    BestMatch(Candidate),
    NoMatch,
}

impl MatchDecision {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, MatchDecision::DuplicateRejected(_))
    }

    pub fn candidate(&self) -> Option<&Candidate> {
        match self {
            MatchDecision::DuplicateRejected(c) | MatchDecision::BestMatch(c) => Some(c),
            MatchDecision::NoMatch => None,
        }
    }
}

/// Distance thresholds for the two matching operations.
///
/// Registration is stricter than login so the same face cannot enroll twice
/// while login stays biased toward fewer false accepts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Distances strictly below this reject a registration as a duplicate.
    pub registration: f64,
    /// Distances strictly below this accept a login.
    pub login: f64,
}

impl Thresholds {
    pub const DEFAULT_REGISTRATION: f64 = 0.3;
    pub const DEFAULT_LOGIN: f64 = 0.5;

    /// Whether registration is at least as strict as login.
    pub fn is_ordered(&self) -> bool {
        self.registration < self.login
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            registration: Self::DEFAULT_REGISTRATION,
            login: Self::DEFAULT_LOGIN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_norm_unit_vector() {
        let d = Descriptor::new(vec![0.6, 0.8]);
        assert!((d.norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_comparable_skips_missing_and_empty() {
        let missing = GalleryEntry { id: 1, label: "a".into(), descriptor: None };
        let empty = GalleryEntry {
            id: 2,
            label: "b".into(),
            descriptor: Some(Descriptor::new(Vec::new())),
        };
        let present = GalleryEntry {
            id: 3,
            label: "c".into(),
            descriptor: Some(Descriptor::new(vec![1.0])),
        };
        assert!(missing.comparable().is_none());
        assert!(empty.comparable().is_none());
        assert!(present.comparable().is_some());
    }

    #[test]
    fn test_default_thresholds_ordered() {
        let t = Thresholds::default();
        assert_eq!(t.registration, 0.3);
        assert_eq!(t.login, 0.5);
        assert!(t.is_ordered());
    }

    #[test]
    fn test_decision_candidate() {
        let c = Candidate { id: 7, label: "x".into(), distance: 0.1 };
        assert!(MatchDecision::DuplicateRejected(c.clone()).is_duplicate());
        assert_eq!(MatchDecision::BestMatch(c.clone()).candidate(), Some(&c));
        assert!(MatchDecision::NoMatch.candidate().is_none());
    }
}
