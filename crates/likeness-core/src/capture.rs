//! Frame acquisition and face capture.
//!
//! Cameras and detectors are collaborators behind [`FrameSource`] and
//! [`FaceDetector`]. [`capture_face`] polls a source until a face shows up,
//! the source runs dry, or the timeout passes.

use crate::types::BoundingBox;
use image::{imageops, Pixel, RgbImage};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Fraction of near-black pixels above which a frame counts as dark.
const DARK_FRAME_PCT: f32 = 0.95;
/// Luma below this is near-black.
const DARK_PIXEL_LUMA: u8 = 32;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to read frame {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode frame {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("frame source failed: {0}")]
    Source(String),
    #[error("face detector failed: {0}")]
    Detector(String),
}

/// A captured RGB frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub sequence: u64,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_dark(&self) -> bool {
        is_dark_frame(&self.image, DARK_FRAME_PCT)
    }
}

/// True if more than `threshold_pct` of pixels are near-black.
/// Webcams emit these while auto-exposure settles.
pub fn is_dark_frame(image: &RgbImage, threshold_pct: f32) -> bool {
    let total = (image.width() * image.height()) as usize;
    if total == 0 {
        return true;
    }
    let dark = image
        .pixels()
        .filter(|p| p.to_luma().0[0] < DARK_PIXEL_LUMA)
        .count();
    (dark as f32 / total as f32) > threshold_pct
}

/// Something that produces frames: a webcam, a video, a folder of stills.
///
/// [`capture_face`] checks its timeout between frames only, so
/// `next_frame` must itself return within a bounded time. A camera that
/// stalls should time out its read and report an error or `None`.
pub trait FrameSource {
    /// Next frame, or `None` once the source is exhausted or abandoned.
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        (**self).next_frame()
    }
}

/// Locates face regions in a frame. An empty result means no face.
pub trait FaceDetector {
    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, CaptureError>;
}

impl<D: FaceDetector + ?Sized> FaceDetector for Box<D> {
    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, CaptureError> {
        (**self).detect_faces(frame)
    }
}

/// Treats every non-empty frame as a single face filling the frame.
/// For inputs that are already cropped to a face.
pub struct WholeFrameDetector;

impl FaceDetector for WholeFrameDetector {
    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, CaptureError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![BoundingBox {
            x: 0.0,
            y: 0.0,
            width: frame.width() as f32,
            height: frame.height() as f32,
            confidence: 1.0,
        }])
    }
}

fn load_frame(path: &Path, sequence: u64) -> Result<Frame, CaptureError> {
    let bytes = fs::read(path).map_err(|source| CaptureError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let image = image::load_from_memory(&bytes)
        .map_err(|source| CaptureError::Decode {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    Ok(Frame { image, sequence })
}

/// Yields a single image file once.
pub struct StillImageSource {
    path: PathBuf,
    done: bool,
}

impl StillImageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            done: false,
        }
    }
}

impl FrameSource for StillImageSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        load_frame(&self.path, 0).map(Some)
    }
}

/// Plays the images in a directory, sorted by file name, as a frame stream.
pub struct DirectorySource {
    pending: VecDeque<PathBuf>,
    sequence: u64,
}

impl DirectorySource {
    pub fn open(dir: &Path) -> Result<Self, CaptureError> {
        let read_err = |source: io::Error| CaptureError::Read {
            path: dir.to_path_buf(),
            source,
        };
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            if path.is_file() && image::ImageFormat::from_path(&path).is_ok() {
                paths.push(path);
            }
        }
        paths.sort();
        tracing::debug!(dir = %dir.display(), frames = paths.len(), "opened frame directory");
        Ok(Self {
            pending: paths.into(),
            sequence: 0,
        })
    }
}

impl FrameSource for DirectorySource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };
        let frame = load_frame(&path, self.sequence)?;
        self.sequence += 1;
        Ok(Some(frame))
    }
}

/// A face cropped out of a captured frame.
#[derive(Clone)]
pub struct CapturedFace {
    pub image: RgbImage,
    pub bbox: BoundingBox,
    pub frame_sequence: u64,
}

/// Pull frames until one contains a face, then crop the most confident one.
///
/// Dark frames are skipped without running the detector. Returns
/// `Ok(None)` when the source ends or `timeout` elapses first.
pub fn capture_face(
    source: &mut dyn FrameSource,
    detector: &mut dyn FaceDetector,
    timeout: Duration,
) -> Result<Option<CapturedFace>, CaptureError> {
    let started = Instant::now();
    let mut dark_skipped = 0usize;
    let mut frames_seen = 0usize;

    loop {
        if started.elapsed() >= timeout {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                frames_seen,
                dark_skipped,
                "capture timed out without a face"
            );
            return Ok(None);
        }

        let Some(frame) = source.next_frame()? else {
            if frames_seen > 0 && dark_skipped == frames_seen {
                tracing::info!(frames_seen, "no face: every frame was too dark to search");
            } else {
                tracing::debug!(frames_seen, dark_skipped, "frame source exhausted");
            }
            return Ok(None);
        };
        frames_seen += 1;

        if frame.is_dark() {
            dark_skipped += 1;
            tracing::debug!(seq = frame.sequence, "skipping dark frame");
            continue;
        }

        let faces = detector.detect_faces(&frame)?;
        let best = faces
            .into_iter()
            .filter_map(|b| b.clamp_to(frame.width(), frame.height()).map(|rect| (b, rect)))
            .max_by(|(a, _), (b, _)| a.confidence.total_cmp(&b.confidence));
        let Some((bbox, (x, y, w, h))) = best else {
            continue;
        };
        let image = imageops::crop_imm(&frame.image, x, y, w, h).to_image();

        tracing::info!(
            seq = frame.sequence,
            confidence = bbox.confidence,
            width = w,
            height = h,
            "face captured"
        );
        return Ok(Some(CapturedFace {
            image,
            bbox,
            frame_sequence: frame.sequence,
        }));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::TempDir;

    /// Frame source over a fixed list of frames.
    pub(crate) struct VecSource(pub VecDeque<Frame>);

    impl VecSource {
        pub(crate) fn new(images: Vec<RgbImage>) -> Self {
            Self(
                images
                    .into_iter()
                    .enumerate()
                    .map(|(i, image)| Frame { image, sequence: i as u64 })
                    .collect(),
            )
        }
    }

    impl FrameSource for VecSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            Ok(self.0.pop_front())
        }
    }

    /// Never runs out of frames.
    struct EndlessSource;

    impl FrameSource for EndlessSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            Ok(Some(Frame {
                image: RgbImage::from_pixel(8, 8, Rgb([128, 128, 128])),
                sequence: 0,
            }))
        }
    }

    struct NoFaces;

    impl FaceDetector for NoFaces {
        fn detect_faces(&mut self, _frame: &Frame) -> Result<Vec<BoundingBox>, CaptureError> {
            Ok(Vec::new())
        }
    }

    struct FixedBoxes(Vec<BoundingBox>);

    impl FaceDetector for FixedBoxes {
        fn detect_faces(&mut self, _frame: &Frame) -> Result<Vec<BoundingBox>, CaptureError> {
            Ok(self.0.clone())
        }
    }

    fn gray(w: u32, h: u32, v: u8) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([v, v, v]))
    }

    #[test]
    fn test_dark_frame_all_black() {
        assert!(is_dark_frame(&gray(10, 10, 0), 0.95));
    }

    #[test]
    fn test_dark_frame_normal() {
        assert!(!is_dark_frame(&gray(10, 10, 128), 0.95));
    }

    #[test]
    fn test_dark_frame_empty() {
        assert!(is_dark_frame(&RgbImage::new(0, 0), 0.95));
    }

    #[test]
    fn test_dark_frame_borderline_bright() {
        // 94 dark pixels, 6 bright → not dark
        let mut img = gray(10, 10, 10);
        for i in 0..6 {
            img.put_pixel(i, 0, Rgb([128, 128, 128]));
        }
        assert!(!is_dark_frame(&img, 0.95));
    }

    #[test]
    fn test_capture_skips_dark_frames() {
        let mut source = VecSource::new(vec![gray(8, 8, 0), gray(8, 8, 0), gray(8, 8, 150)]);
        let face = capture_face(&mut source, &mut WholeFrameDetector, Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(face.frame_sequence, 2);
        assert_eq!(face.image.dimensions(), (8, 8));
    }

    #[test]
    fn test_capture_only_dark_frames_is_no_face() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dim.png");
        gray(8, 8, 10).save(&path).unwrap();

        let mut source = StillImageSource::new(&path);
        let result = capture_face(&mut source, &mut WholeFrameDetector, Duration::from_secs(5)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_boxed_detector_delegates() {
        let mut detector: Box<dyn FaceDetector> = Box::new(NoFaces);
        let mut source = VecSource::new(vec![gray(8, 8, 150)]);
        assert!(capture_face(&mut source, &mut detector, Duration::from_secs(5)).unwrap().is_none());
    }

    #[test]
    fn test_capture_no_face_when_source_exhausted() {
        let mut source = VecSource::new(vec![gray(8, 8, 150), gray(8, 8, 150)]);
        let result = capture_face(&mut source, &mut NoFaces, Duration::from_secs(5)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_capture_times_out() {
        let started = Instant::now();
        let result =
            capture_face(&mut EndlessSource, &mut NoFaces, Duration::from_millis(50)).unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_capture_crops_most_confident_face() {
        let mut img = gray(20, 20, 100);
        img.put_pixel(12, 12, Rgb([255, 0, 0]));
        let mut source = VecSource::new(vec![img]);
        let mut detector = FixedBoxes(vec![
            BoundingBox { x: 0.0, y: 0.0, width: 5.0, height: 5.0, confidence: 0.6 },
            BoundingBox { x: 10.0, y: 10.0, width: 4.0, height: 6.0, confidence: 0.9 },
            BoundingBox { x: 50.0, y: 50.0, width: 5.0, height: 5.0, confidence: 0.99 },
        ]);

        let face = capture_face(&mut source, &mut detector, Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(face.image.dimensions(), (4, 6));
        assert_eq!(face.image.get_pixel(2, 2), &Rgb([255, 0, 0]));
        assert!((face.bbox.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_directory_source_plays_sorted_images() {
        let tmp = TempDir::new().unwrap();
        gray(4, 4, 50).save(tmp.path().join("b.png")).unwrap();
        gray(6, 6, 50).save(tmp.path().join("a.png")).unwrap();
        fs::write(tmp.path().join("notes.txt"), "skip me").unwrap();

        let mut source = DirectorySource::open(tmp.path()).unwrap();
        let first = source.next_frame().unwrap().unwrap();
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(first.image.dimensions(), (6, 6));
        assert_eq!(second.image.dimensions(), (4, 4));
        assert_eq!(second.sequence, 1);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_still_image_source_yields_once() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("face.png");
        gray(5, 7, 90).save(&path).unwrap();

        let mut source = StillImageSource::new(&path);
        assert_eq!(source.next_frame().unwrap().unwrap().image.dimensions(), (5, 7));
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_still_image_source_missing_file() {
        let mut source = StillImageSource::new("/nonexistent/face.png");
        assert!(matches!(source.next_frame(), Err(CaptureError::Read { .. })));
    }
}
