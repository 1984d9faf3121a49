use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Clamp the box to a `width` x `height` frame.
    ///
    /// Returns `(x, y, w, h)` in whole pixels, or `None` if nothing of the
    /// box lies inside the frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor();
        let y0 = self.y.max(0.0).floor();
        let x1 = (self.x + self.width).min(width as f32).ceil();
        let y1 = (self.y + self.height).min(height as f32).ceil();

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

/// Face embedding vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "w600k_r50", "thumbnail-32").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance clamped to [0, 1]. Lower = more similar.
    ///
    /// Anti-correlated embeddings saturate at 1.0; they are never a match
    /// under any threshold in range, so the lost resolution is irrelevant.
    pub fn distance(&self, other: &Embedding) -> f32 {
        (1.0 - self.similarity(other)).clamp(0.0, 1.0)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NameError {
    #[error("identity name is empty")]
    EmptyName,
    #[error("identity name {0:?} is not a valid folder name")]
    InvalidName(String),
}

/// Human-chosen identity name, validated to be a single path component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityName(String);

impl IdentityName {
    /// Trim and validate operator input.
    ///
    /// Names are used verbatim as folder names, so anything that could
    /// escape the gallery root or hide from directory listings is refused
    /// rather than rewritten.
    pub fn parse(raw: &str) -> Result<Self, NameError> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(NameError::EmptyName);
        }
        let bad = name.starts_with('.')
            || name.contains(['/', '\\', '\0'])
            || name.chars().any(char::is_control);
        if bad {
            return Err(NameError::InvalidName(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    /// Recover the identity name from a stored image path
    /// (`<root>/<name>/face_<n>.jpg`).
    pub fn from_image_path(path: &Path) -> Option<Self> {
        let dir = path.parent()?.file_name()?.to_str()?;
        Self::parse(dir).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdentityName {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IdentityName> for String {
    fn from(name: IdentityName) -> Self {
        name.0
    }
}

impl fmt::Display for IdentityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdentityName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A person known to the gallery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: IdentityName,
    pub image_count: u64,
}

/// One entry of a comparator result.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    /// Stored image the probe was closest to.
    pub identity_path: PathBuf,
    /// Dissimilarity in [0, 1]. `None` when the comparator did not report one.
    pub distance: Option<f32>,
}

/// Best match of a probe against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub best_identity: Option<IdentityName>,
    pub distance: Option<f32>,
}

impl MatchResult {
    /// Reduce comparator output (best first) to the best match.
    pub fn from_candidates(candidates: &[MatchCandidate]) -> Self {
        match candidates.first() {
            Some(best) => Self {
                best_identity: IdentityName::from_image_path(&best.identity_path),
                distance: best.distance,
            },
            None => Self::none(),
        }
    }

    pub fn none() -> Self {
        Self {
            best_identity: None,
            distance: None,
        }
    }

    /// The matched identity and its distance, if confident under
    /// `threshold`.
    ///
    /// The threshold is a maximum acceptable distance: only a distance
    /// strictly below it counts. Missing distance or identity never matches.
    pub fn confident_match(&self, threshold: f32) -> Option<(&IdentityName, f32)> {
        match (&self.best_identity, self.distance) {
            (Some(name), Some(d)) if d < threshold => Some((name, d)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec(), model_version: None }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
        assert!(a.distance(&a).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_orthogonal() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[0.0, 1.0]);
        assert!((a.distance(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_opposite_saturates() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[-1.0, 0.0]);
        assert_eq!(a.distance(&b), 1.0);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
        assert_eq!(a.distance(&b), 1.0);
    }

    #[test]
    fn test_name_trims_whitespace() {
        let name = IdentityName::parse("  Alice \n").unwrap();
        assert_eq!(name.as_str(), "Alice");
    }

    #[test]
    fn test_name_rejects_blank() {
        assert_eq!(IdentityName::parse(""), Err(NameError::EmptyName));
        assert_eq!(IdentityName::parse("   \t"), Err(NameError::EmptyName));
    }

    #[test]
    fn test_name_rejects_path_components() {
        for raw in ["..", ".", ".hidden", "a/b", "a\\b", "nul\0byte"] {
            assert!(
                matches!(IdentityName::parse(raw), Err(NameError::InvalidName(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_name_allows_spaces_and_unicode() {
        assert!(IdentityName::parse("Mary Ann").is_ok());
        assert!(IdentityName::parse("Zoë").is_ok());
    }

    #[test]
    fn test_name_from_image_path() {
        let path = Path::new("/data/learned_faces/Bob/face_3.jpg");
        assert_eq!(IdentityName::from_image_path(path).unwrap().as_str(), "Bob");
    }

    #[test]
    fn test_match_threshold_is_strict_maximum() {
        let result = MatchResult {
            best_identity: Some(IdentityName::parse("Alice").unwrap()),
            distance: Some(0.4),
        };
        assert!(result.confident_match(0.4).is_none());
        assert!(result.confident_match(0.39).is_none());
        let (name, distance) = result.confident_match(0.41).unwrap();
        assert_eq!(name.as_str(), "Alice");
        assert_eq!(distance, 0.4);
    }

    #[test]
    fn test_match_without_distance_is_not_confident() {
        let result = MatchResult {
            best_identity: Some(IdentityName::parse("Alice").unwrap()),
            distance: None,
        };
        assert!(result.confident_match(1.0).is_none());
    }

    #[test]
    fn test_match_from_empty_candidates() {
        let result = MatchResult::from_candidates(&[]);
        assert_eq!(result, MatchResult::none());
        assert!(result.confident_match(0.4).is_none());
    }

    #[test]
    fn test_bbox_clamp_inside() {
        let b = BoundingBox { x: 10.0, y: 20.0, width: 30.0, height: 40.0, confidence: 0.9 };
        assert_eq!(b.clamp_to(100, 100), Some((10, 20, 30, 40)));
    }

    #[test]
    fn test_bbox_clamp_overhanging() {
        let b = BoundingBox { x: -5.0, y: 90.0, width: 20.0, height: 20.0, confidence: 0.9 };
        assert_eq!(b.clamp_to(100, 100), Some((0, 90, 15, 10)));
    }

    #[test]
    fn test_bbox_clamp_outside() {
        let b = BoundingBox { x: 200.0, y: 0.0, width: 20.0, height: 20.0, confidence: 0.9 };
        assert_eq!(b.clamp_to(100, 100), None);
    }
}
