//! ArcFace face embedder via ONNX Runtime.
//!
//! Takes a face crop, resizes it to the 112x112 ArcFace input and returns
//! the L2-normalised 512-dimensional embedding.

use crate::embedder::{l2_normalize, EmbedError, Embedder};
use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric normalization, not 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;

/// ArcFace-based embedder.
pub struct ArcFaceEmbedder {
    session: Session,
    model_version: String,
}

impl ArcFaceEmbedder {
    /// Load an ArcFace ONNX model. The file stem becomes the model version
    /// recorded on each embedding (e.g. "w600k_r50").
    pub fn load(model_path: &Path) -> Result<Self, EmbedError> {
        if !model_path.exists() {
            return Err(EmbedError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let model_version = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "arcface".to_string());

        tracing::info!(path = %model_path.display(), model = %model_version, "loaded ArcFace model");

        Ok(Self {
            session,
            model_version,
        })
    }

    /// Resize an RGB face crop and pack it into a NCHW float tensor.
    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let resized = imageops::resize(face, size as u32, size as u32, FilterType::Triangle);
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                tensor[[0, c, y, x]] = (pixel.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}

impl Embedder for ArcFaceEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(EmbedError::InferenceFailed("empty face image".into()));
        }

        let input = Self::preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(self.model_version.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let face = RgbImage::from_pixel(40, 60, Rgb([128, 128, 128]));
        let tensor = ArcFaceEmbedder::preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let face = RgbImage::from_pixel(112, 112, Rgb([128, 128, 128]));
        let tensor = ArcFaceEmbedder::preprocess(&face);
        let val = tensor[[0, 0, 0, 0]];
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((val - expected).abs() < 1e-6, "got {val}, expected {expected}");
    }

    #[test]
    fn test_preprocess_keeps_rgb_channel_order() {
        let face = RgbImage::from_pixel(112, 112, Rgb([255, 0, 128]));
        let tensor = ArcFaceEmbedder::preprocess(&face);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
        assert!(tensor[[0, 2, 5, 5]].abs() < 0.01);
    }

    #[test]
    fn test_load_missing_model() {
        let err = ArcFaceEmbedder::load(Path::new("/nonexistent/w600k_r50.onnx")).err();
        assert!(matches!(err, Some(EmbedError::ModelNotFound(_))));
    }
}
