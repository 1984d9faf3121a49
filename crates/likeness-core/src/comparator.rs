//! Gallery comparison: rank stored identities by distance to a probe face.

use crate::embedder::{EmbedError, Embedder};
use crate::gallery::{GalleryError, GalleryStore};
use crate::types::{Embedding, MatchCandidate};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ComparisonFailure {
    #[error("embedding failed: {0}")]
    Embed(#[from] EmbedError),
    #[error("gallery unreadable: {0}")]
    Gallery(#[from] GalleryError),
    #[error("malformed comparison result: {0}")]
    Malformed(String),
}

/// Compares a probe image against every identity in a gallery.
pub trait FaceComparator {
    /// Candidates ordered best first (lowest distance). Empty when the
    /// gallery holds nothing to compare against.
    fn find_best_match(
        &mut self,
        query: &Path,
        gallery: &GalleryStore,
    ) -> Result<Vec<MatchCandidate>, ComparisonFailure>;
}

/// Comparator built on any [`Embedder`], using cosine distance.
///
/// Gallery embeddings are cached by path; stored images are never
/// rewritten in place, so a cached entry stays valid until its file goes.
pub struct EmbeddingComparator<E> {
    embedder: E,
    cache: HashMap<PathBuf, Embedding>,
}

impl<E: Embedder> EmbeddingComparator<E> {
    pub fn new(embedder: E) -> Self {
        Self {
            embedder,
            cache: HashMap::new(),
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn gallery_embedding(&mut self, path: &Path) -> Result<&Embedding, EmbedError> {
        if !self.cache.contains_key(path) {
            let embedding = self.embedder.embed_file(path)?;
            self.cache.insert(path.to_path_buf(), embedding);
        }
        self.cache
            .get(path)
            .ok_or_else(|| EmbedError::InferenceFailed("embedding cache miss".into()))
    }
}

impl<E: Embedder> FaceComparator for EmbeddingComparator<E> {
    fn find_best_match(
        &mut self,
        query: &Path,
        gallery: &GalleryStore,
    ) -> Result<Vec<MatchCandidate>, ComparisonFailure> {
        // The query lives in the staging slot and changes every capture,
        // so it is never cached.
        let probe = self.embedder.embed_file(query)?;

        let mut live = HashSet::new();
        let mut candidates = Vec::new();

        for name in gallery.list_identities()? {
            let mut best: Option<(f32, PathBuf)> = None;
            for path in gallery.images(&name)? {
                let distance = probe.distance(self.gallery_embedding(&path)?);
                if distance.is_nan() {
                    return Err(ComparisonFailure::Malformed(format!(
                        "NaN distance against {}",
                        path.display()
                    )));
                }
                if best.as_ref().map_or(true, |(d, _)| distance < *d) {
                    best = Some((distance, path.clone()));
                }
                live.insert(path);
            }
            if let Some((distance, identity_path)) = best {
                candidates.push(MatchCandidate {
                    identity_path,
                    distance: Some(distance),
                });
            }
        }

        self.cache.retain(|path, _| live.contains(path));

        candidates.sort_by(|a, b| {
            let da = a.distance.unwrap_or(f32::INFINITY);
            let db = b.distance.unwrap_or(f32::INFINITY);
            da.total_cmp(&db)
        });

        tracing::debug!(
            identities = candidates.len(),
            best = ?candidates.first().and_then(|c| c.distance),
            "compared probe against gallery"
        );
        Ok(candidates)
    }
}
