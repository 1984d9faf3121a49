//! Single-slot staging file for the face currently being resolved.

use crate::gallery::{write_atomic, GalleryError};
use image::{ImageFormat, RgbImage};
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("failed to encode staged face: {0}")]
    Encode(#[from] image::ImageError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
}

/// Well-known path that each capture overwrites.
#[derive(Debug, Clone)]
pub struct StagingSlot {
    path: PathBuf,
}

impl StagingSlot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_occupied(&self) -> bool {
        self.path.is_file()
    }

    /// Encode `face` as JPEG and replace whatever the slot held.
    pub fn write(&self, face: &RgbImage) -> Result<(), StagingError> {
        let mut buf = Cursor::new(Vec::new());
        face.write_to(&mut buf, ImageFormat::Jpeg)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| GalleryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        write_atomic(&self.path, buf.get_ref())?;
        tracing::debug!(path = %self.path.display(), bytes = buf.get_ref().len(), "staged face");
        Ok(())
    }

    /// Remove the staged file, if any.
    pub fn discard(&self) -> Result<(), GalleryError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(GalleryError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_overwrites_single_slot() {
        let tmp = TempDir::new().unwrap();
        let slot = StagingSlot::new(tmp.path().join("temp_faces/temp_face.jpg"));
        assert!(!slot.is_occupied());

        slot.write(&RgbImage::from_pixel(8, 8, image::Rgb([200, 10, 10]))).unwrap();
        slot.write(&RgbImage::from_pixel(16, 4, image::Rgb([10, 200, 10]))).unwrap();

        assert!(slot.is_occupied());
        let staged = image::open(slot.path()).unwrap();
        assert_eq!((staged.width(), staged.height()), (16, 4));
        assert_eq!(fs::read_dir(tmp.path().join("temp_faces")).unwrap().count(), 1);
    }

    #[test]
    fn test_discard_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let slot = StagingSlot::new(tmp.path().join("temp_face.jpg"));
        slot.write(&RgbImage::new(4, 4)).unwrap();

        slot.discard().unwrap();
        slot.discard().unwrap();
        assert!(!slot.is_occupied());
    }
}
