//! likeness-core — Face gallery and identity resolution.
//!
//! Captures a face, compares it against a folder-per-identity gallery and
//! either reinforces a confident match or enrolls the face under a
//! human-chosen name. Cameras, detectors and embedding models plug in
//! through traits; SCRFD and ArcFace run on ONNX Runtime.

pub mod capture;
pub mod comparator;
pub mod detector;
pub mod embedder;
pub mod gallery;
pub mod recognizer;
pub mod resolver;
pub mod staging;
pub mod types;

pub use capture::{
    capture_face, CaptureError, CapturedFace, DirectorySource, FaceDetector, Frame, FrameSource,
    StillImageSource, WholeFrameDetector,
};
pub use comparator::{ComparisonFailure, EmbeddingComparator, FaceComparator};
pub use detector::{DetectorError, ScrfdDetector};
pub use embedder::{EmbedError, Embedder, ThumbnailEmbedder};
pub use gallery::{ConsistencyReport, Counts, GalleryError, GalleryStore};
pub use recognizer::ArcFaceEmbedder;
pub use resolver::{
    ComparisonPolicy, EnrollReason, IdentityResolver, Outcome, PendingEnrollment, ResolveError,
    Resolved, ResolvedBy, ResolverConfig, Unresolved,
};
pub use staging::{StagingError, StagingSlot};
pub use types::{BoundingBox, Embedding, Identity, IdentityName, MatchCandidate, MatchResult, NameError};
