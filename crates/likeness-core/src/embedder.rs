//! Face embedders: turn a face crop into an [`Embedding`].

use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const THUMBNAIL_SIZE: u32 = 32;
const THUMBNAIL_MODEL_VERSION: &str = "thumbnail-32";

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("failed to read face image {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode face image {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces an embedding for a cropped face.
pub trait Embedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedError>;

    /// Read and decode an image file, then embed it.
    fn embed_file(&mut self, path: &Path) -> Result<Embedding, EmbedError> {
        let bytes = std::fs::read(path).map_err(|source| EmbedError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let face = image::load_from_memory(&bytes)
            .map_err(|source| EmbedError::Decode {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgb8();
        self.embed(&face)
    }
}

impl<E: Embedder + ?Sized> Embedder for Box<E> {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedError> {
        (**self).embed(face)
    }
}

/// Model-free embedder: a mean-centred, L2-normalised 32x32 grayscale
/// thumbnail. Only tells apart images that look alike pixel for pixel, so
/// it suits headless runs and tests rather than real recognition.
#[derive(Debug, Default)]
pub struct ThumbnailEmbedder;

impl Embedder for ThumbnailEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(EmbedError::InferenceFailed("empty face image".into()));
        }

        let gray = imageops::grayscale(face);
        let thumb = imageops::resize(&gray, THUMBNAIL_SIZE, THUMBNAIL_SIZE, FilterType::Triangle);

        let raw: Vec<f32> = thumb.pixels().map(|p| p.0[0] as f32).collect();
        let mean = raw.iter().sum::<f32>() / raw.len() as f32;
        let centred: Vec<f32> = raw.iter().map(|v| v - mean).collect();

        Ok(Embedding {
            values: l2_normalize(centred),
            model_version: Some(THUMBNAIL_MODEL_VERSION.to_string()),
        })
    }
}

/// Scale to unit length. Zero vectors are returned unchanged.
pub(crate) fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(w: u32, h: u32, invert: bool) -> RgbImage {
        RgbImage::from_fn(w, h, |x, _| {
            let v = (x * 255 / (w - 1)) as u8;
            let v = if invert { 255 - v } else { v };
            Rgb([v, v, v])
        })
    }

    #[test]
    fn test_thumbnail_shape_and_norm() {
        let e = ThumbnailEmbedder.embed(&gradient(64, 48, false)).unwrap();
        assert_eq!(e.values.len(), (THUMBNAIL_SIZE * THUMBNAIL_SIZE) as usize);
        let norm: f32 = e.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert_eq!(e.model_version.as_deref(), Some("thumbnail-32"));
    }

    #[test]
    fn test_thumbnail_same_face_different_scale_is_close() {
        let a = ThumbnailEmbedder.embed(&gradient(64, 64, false)).unwrap();
        let b = ThumbnailEmbedder.embed(&gradient(128, 128, false)).unwrap();
        assert!(a.distance(&b) < 0.05, "distance {}", a.distance(&b));
    }

    #[test]
    fn test_thumbnail_inverted_face_is_far() {
        let a = ThumbnailEmbedder.embed(&gradient(64, 64, false)).unwrap();
        let b = ThumbnailEmbedder.embed(&gradient(64, 64, true)).unwrap();
        assert!(a.distance(&b) > 0.9);
    }

    #[test]
    fn test_thumbnail_rejects_empty_image() {
        assert!(ThumbnailEmbedder.embed(&RgbImage::new(0, 0)).is_err());
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }
}
