//! Identity resolution: capture a face, compare it against the gallery and
//! either reinforce a confident match or enroll under a human-given name.
//!
//! ```text
//! CAPTURE ─ no face ─────────────────────────────► Unresolved
//!    │
//!    ▼
//! COMPARE ─ empty gallery / no match / d >= T ───► NameRequired ─ enroll(name) ─► Resolved
//!    │
//!    └───── d < T ──────────────────────────────► Resolved (reinforced)
//! ```
//!
//! Naming is a suspension point: [`IdentityResolver::resolve`] hands back a
//! [`PendingEnrollment`] and the caller finishes it with
//! [`IdentityResolver::enroll`] once it has a name, so the same resolver
//! works behind a terminal prompt or a request handler.

use crate::capture::{capture_face, FaceDetector, FrameSource};
use crate::comparator::FaceComparator;
use crate::gallery::{GalleryError, GalleryStore};
use crate::staging::{StagingError, StagingSlot};
use crate::types::{Identity, IdentityName, MatchResult};
use serde::Deserialize;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_THRESHOLD: f32 = 0.4;
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error("pending enrollment is stale: a newer capture replaced the staged face")]
    StalePending,
    #[error("name prompt failed: {0}")]
    Prompt(#[source] io::Error),
}

/// What to do when the comparator fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonPolicy {
    /// Give up on this capture; nothing is written.
    #[default]
    Abort,
    /// Treat the capture as unmatched and ask for a name.
    Enroll,
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Maximum distance, exclusive, for a confident match.
    pub threshold: f32,
    pub capture_timeout: Duration,
    pub on_comparison_failure: ComparisonPolicy,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            on_comparison_failure: ComparisonPolicy::default(),
        }
    }
}

/// Why a cycle ended without an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unresolved {
    NoFace,
    CaptureFailed,
    ComparisonFailed,
}

/// Why a name is being asked for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EnrollReason {
    EmptyGallery,
    NoMatch,
    LowConfidence { distance: f32 },
    MissingDistance,
    ComparisonFailed,
}

/// How a resolved identity was reached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolvedBy {
    Reinforcement { distance: f32 },
    Enrollment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub identity: Identity,
    /// Where the captured face now lives in the gallery.
    pub stored: PathBuf,
    pub by: ResolvedBy,
}

/// A staged face waiting for a name.
#[derive(Debug)]
pub struct PendingEnrollment {
    capture_id: u64,
    reason: EnrollReason,
    best_match: MatchResult,
}

impl PendingEnrollment {
    pub fn reason(&self) -> EnrollReason {
        self.reason
    }

    /// Closest identity found, if any. A caller may offer it as the
    /// default name.
    pub fn best_match(&self) -> &MatchResult {
        &self.best_match
    }
}

#[derive(Debug)]
pub enum Outcome {
    Unresolved(Unresolved),
    Resolved(Resolved),
    NameRequired(PendingEnrollment),
}

/// Runs capture → compare → reinforce/enroll against one gallery.
pub struct IdentityResolver<S, D, C> {
    gallery: GalleryStore,
    staging: StagingSlot,
    source: S,
    detector: D,
    comparator: C,
    config: ResolverConfig,
    /// Bumped whenever the staging slot is overwritten.
    captures: u64,
}

impl<S, D, C> IdentityResolver<S, D, C>
where
    S: FrameSource,
    D: FaceDetector,
    C: FaceComparator,
{
    pub fn new(
        gallery: GalleryStore,
        staging: StagingSlot,
        source: S,
        detector: D,
        comparator: C,
        config: ResolverConfig,
    ) -> Self {
        Self {
            gallery,
            staging,
            source,
            detector,
            comparator,
            config,
            captures: 0,
        }
    }

    pub fn gallery(&self) -> &GalleryStore {
        &self.gallery
    }

    /// Run one cycle up to the point where a name would be needed.
    ///
    /// Capture and comparison problems end the cycle as
    /// [`Outcome::Unresolved`]; gallery I/O and ledger corruption are
    /// returned as errors.
    pub fn resolve(&mut self) -> Result<Outcome, ResolveError> {
        let face = match capture_face(&mut self.source, &mut self.detector, self.config.capture_timeout) {
            Ok(Some(face)) => face,
            Ok(None) => {
                tracing::info!("no face detected");
                return Ok(Outcome::Unresolved(Unresolved::NoFace));
            }
            Err(e) => {
                tracing::warn!(error = %e, "capture failed");
                return Ok(Outcome::Unresolved(Unresolved::CaptureFailed));
            }
        };

        self.staging.write(&face.image)?;
        self.captures += 1;

        if self.gallery.list_identities()?.is_empty() {
            tracing::info!("gallery empty, enrolling first face");
            return Ok(self.name_required(EnrollReason::EmptyGallery, MatchResult::none()));
        }

        let best = match self.comparator.find_best_match(self.staging.path(), &self.gallery) {
            Ok(candidates) => MatchResult::from_candidates(&candidates),
            Err(e) => {
                tracing::warn!(error = %e, policy = ?self.config.on_comparison_failure, "comparison failed");
                return Ok(match self.config.on_comparison_failure {
                    ComparisonPolicy::Abort => Outcome::Unresolved(Unresolved::ComparisonFailed),
                    ComparisonPolicy::Enroll => {
                        self.name_required(EnrollReason::ComparisonFailed, MatchResult::none())
                    }
                });
            }
        };

        let threshold = self.config.threshold;
        if let Some((name, distance)) = best.confident_match(threshold) {
            let name = name.clone();
            tracing::info!(name = %name, distance, threshold, "confident match");
            let (identity, stored) = self.commit(&name)?;
            return Ok(Outcome::Resolved(Resolved {
                identity,
                stored,
                by: ResolvedBy::Reinforcement { distance },
            }));
        }

        let reason = match (&best.best_identity, best.distance) {
            (None, _) => EnrollReason::NoMatch,
            (Some(_), None) => EnrollReason::MissingDistance,
            (Some(_), Some(distance)) => EnrollReason::LowConfidence { distance },
        };

        tracing::info!(?reason, closest = ?best.best_identity, threshold, "no confident match");
        Ok(self.name_required(reason, best))
    }

    /// Finish a pending enrollment under `name`. A name that already
    /// exists in the gallery gains the image, as a reinforcement would.
    pub fn enroll(
        &mut self,
        pending: PendingEnrollment,
        name: IdentityName,
    ) -> Result<Resolved, ResolveError> {
        if pending.capture_id != self.captures || !self.staging.is_occupied() {
            return Err(ResolveError::StalePending);
        }

        if self.gallery.list_identities()?.contains(&name) {
            tracing::info!(name = %name, reason = ?pending.reason, "enrolling under existing identity");
        }

        let (identity, stored) = self.commit(&name)?;
        Ok(Resolved {
            identity,
            stored,
            by: ResolvedBy::Enrollment,
        })
    }

    /// Drop a pending enrollment and clear the staging slot.
    pub fn discard(&mut self, pending: PendingEnrollment) -> Result<(), ResolveError> {
        if pending.capture_id == self.captures {
            self.staging.discard()?;
        }
        Ok(())
    }

    /// Full cycle, asking `prompt` for a name when one is needed.
    ///
    /// Blank or unusable names are rejected and `prompt` is asked again.
    /// Returns `None` when no identity was resolved.
    pub fn resolve_interactive<F>(&mut self, mut prompt: F) -> Result<Option<Identity>, ResolveError>
    where
        F: FnMut(&PendingEnrollment) -> io::Result<String>,
    {
        let pending = match self.resolve()? {
            Outcome::Unresolved(_) => return Ok(None),
            Outcome::Resolved(resolved) => return Ok(Some(resolved.identity)),
            Outcome::NameRequired(pending) => pending,
        };

        loop {
            let raw = prompt(&pending).map_err(ResolveError::Prompt)?;
            match IdentityName::parse(&raw) {
                Ok(name) => return self.enroll(pending, name).map(|r| Some(r.identity)),
                Err(e) => tracing::warn!(error = %e, "rejected identity name, asking again"),
            }
        }
    }

    fn name_required(&self, reason: EnrollReason, best_match: MatchResult) -> Outcome {
        Outcome::NameRequired(PendingEnrollment {
            capture_id: self.captures,
            reason,
            best_match,
        })
    }

    /// Move the staged face under `name`, bump and persist its count.
    ///
    /// The ledger is read first so a corrupt ledger stops the cycle before
    /// the staged face is moved.
    fn commit(&mut self, name: &IdentityName) -> Result<(Identity, PathBuf), ResolveError> {
        let mut counts = self.gallery.load_counts()?;
        let stored = self.gallery.append_file(name, self.staging.path())?;
        let image_count = counts.bump_count(name);
        self.gallery.save_counts(&counts)?;

        tracing::info!(name = %name, image_count, path = %stored.display(), "identity updated");
        Ok((
            Identity {
                name: name.clone(),
                image_count,
            },
            stored,
        ))
    }
}
