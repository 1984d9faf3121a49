//! On-disk face gallery: one folder of numbered images per identity, plus
//! a JSON counts ledger.
//!
//! Layout:
//!
//! ```text
//! <root>/<name>/face_0.jpg
//! <root>/<name>/face_1.jpg
//! <root>/<name>/.next_index
//! <ledger>                      {"Alice": 2, "Bob": 1}
//! ```
//!
//! Image indices are claimed with exclusive file creation, so concurrent
//! writers to the same identity never overwrite each other. `.next_index`
//! only spares the claim loop from rescanning the folder.

use crate::types::IdentityName;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_PREFIX: &str = "face_";
const IMAGE_EXT: &str = "jpg";
const NEXT_INDEX_FILE: &str = ".next_index";

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("I/O failure at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("counts ledger {} is corrupt: {source}", path.display())]
    CorruptLedger {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl GalleryError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Enrollment counts keyed by identity name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Counts(BTreeMap<String, u64>);

impl Counts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> u64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    /// Increment `name`'s count in memory and return the new value.
    /// Persist with [`GalleryStore::save_counts`].
    pub fn bump_count(&mut self, name: &IdentityName) -> u64 {
        let count = self.0.entry(name.as_str().to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, u64>> for Counts {
    fn from(map: BTreeMap<String, u64>) -> Self {
        Self(map)
    }
}

/// Differences between the ledger and the folders on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Identity folders with no ledger entry.
    pub unledgered: Vec<IdentityName>,
    /// Ledger entries with no image folder.
    pub orphaned: Vec<String>,
    /// `(name, ledger count, images on disk)` where the two disagree.
    pub mismatched: Vec<(IdentityName, u64, usize)>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.unledgered.is_empty() && self.orphaned.is_empty() && self.mismatched.is_empty()
    }
}

/// Owns a gallery root and its counts ledger. All gallery mutation goes
/// through this type.
#[derive(Debug, Clone)]
pub struct GalleryStore {
    root: PathBuf,
    ledger_path: PathBuf,
}

impl GalleryStore {
    /// Create a store handle. Nothing is touched on disk until first use.
    pub fn new(root: impl Into<PathBuf>, ledger_path: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ledger_path: ledger_path.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    /// Read the counts ledger. A missing file is an empty ledger.
    pub fn load_counts(&self) -> Result<Counts, GalleryError> {
        let raw = match fs::read(&self.ledger_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.ledger_path.display(), "no ledger yet");
                return Ok(Counts::new());
            }
            Err(e) => return Err(GalleryError::io(&self.ledger_path)(e)),
        };

        serde_json::from_slice(&raw).map_err(|source| GalleryError::CorruptLedger {
            path: self.ledger_path.clone(),
            source,
        })
    }

    /// Replace the ledger with `counts`.
    pub fn save_counts(&self, counts: &Counts) -> Result<(), GalleryError> {
        let json = serde_json::to_vec_pretty(counts)
            .map_err(|e| GalleryError::io(&self.ledger_path)(io::Error::other(e)))?;
        if let Some(parent) = self.ledger_path.parent() {
            fs::create_dir_all(parent).map_err(GalleryError::io(parent))?;
        }
        write_atomic(&self.ledger_path, &json)?;
        tracing::debug!(path = %self.ledger_path.display(), identities = counts.len(), "ledger saved");
        Ok(())
    }

    /// Identities with at least one stored image, read from the folders.
    /// Independent of the ledger.
    pub fn list_identities(&self) -> Result<BTreeSet<IdentityName>, GalleryError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(GalleryError::io(&self.root)(e)),
        };

        let mut names = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(GalleryError::io(&self.root))?;
            let is_dir = entry
                .file_type()
                .map_err(GalleryError::io(&entry.path()))?
                .is_dir();
            if !is_dir {
                continue;
            }
            let Some(name) = entry.file_name().to_str().and_then(|s| IdentityName::parse(s).ok())
            else {
                continue;
            };
            if !self.images(&name)?.is_empty() {
                names.insert(name);
            }
        }
        Ok(names)
    }

    /// Stored image paths for `name`, in index order.
    pub fn images(&self, name: &IdentityName) -> Result<Vec<PathBuf>, GalleryError> {
        Ok(self.scan_indices(&self.identity_dir(name))?.into_values().collect())
    }

    /// Store `image` as the next image of `name`, creating the identity
    /// folder on first enrollment.
    pub fn append_image(&self, name: &IdentityName, image: &[u8]) -> Result<PathBuf, GalleryError> {
        let (mut file, path, index) = self.claim_next(name)?;

        let written = file.write_all(image).and_then(|()| file.sync_all());
        if let Err(e) = written {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(GalleryError::io(&path)(e));
        }

        self.record_next_index(name, index);
        tracing::info!(name = %name, path = %path.display(), "stored face image");
        Ok(path)
    }

    /// Move an already-written image file into `name`'s folder.
    ///
    /// On failure `staged` is left where it was.
    pub fn append_file(&self, name: &IdentityName, staged: &Path) -> Result<PathBuf, GalleryError> {
        let (file, path, index) = self.claim_next(name)?;
        drop(file);

        // Moving over our own placeholder keeps the index claimed throughout.
        if let Err(e) = move_file(staged, &path) {
            let _ = fs::remove_file(&path);
            return Err(GalleryError::io(staged)(e));
        }

        self.record_next_index(name, index);
        tracing::info!(
            name = %name,
            from = %staged.display(),
            path = %path.display(),
            "moved staged face into gallery"
        );
        Ok(path)
    }

    /// Compare the ledger against the folders without changing either.
    pub fn check(&self) -> Result<ConsistencyReport, GalleryError> {
        let counts = self.load_counts()?;
        let identities = self.list_identities()?;
        let mut report = ConsistencyReport::default();

        for name in &identities {
            let on_disk = self.images(name)?.len();
            match counts.0.get(name.as_str()) {
                None => report.unledgered.push(name.clone()),
                Some(&ledger) if ledger != on_disk as u64 => {
                    report.mismatched.push((name.clone(), ledger, on_disk))
                }
                Some(_) => {}
            }
        }

        for (name, _) in counts.iter() {
            let on_disk = IdentityName::parse(name)
                .map(|n| identities.contains(&n))
                .unwrap_or(false);
            if !on_disk {
                report.orphaned.push(name.to_string());
            }
        }

        Ok(report)
    }

    fn identity_dir(&self, name: &IdentityName) -> PathBuf {
        self.root.join(name.as_str())
    }

    /// Map of index → path for every `face_<n>.jpg` in `dir`.
    fn scan_indices(&self, dir: &Path) -> Result<BTreeMap<u64, PathBuf>, GalleryError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(GalleryError::io(dir)(e)),
        };

        let mut indices = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(GalleryError::io(dir))?;
            if let Some(index) = entry.file_name().to_str().and_then(parse_image_index) {
                indices.insert(index, entry.path());
            }
        }
        Ok(indices)
    }

    /// Exclusively create the next free `face_<n>.jpg` for `name`.
    fn claim_next(&self, name: &IdentityName) -> Result<(File, PathBuf, u64), GalleryError> {
        let dir = self.identity_dir(name);
        fs::create_dir_all(&dir).map_err(GalleryError::io(&dir))?;

        let scanned = match self.scan_indices(&dir)?.keys().next_back() {
            Some(&last) => last.checked_add(1).ok_or_else(|| index_exhausted(&dir))?,
            None => 0,
        };
        let mut index = self.read_next_index(&dir).map_or(scanned, |n| n.max(scanned));

        loop {
            let path = dir.join(image_file_name(index));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((file, path, index)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::debug!(name = %name, index, "index taken, trying next");
                    index = index.checked_add(1).ok_or_else(|| index_exhausted(&dir))?;
                }
                Err(e) => return Err(GalleryError::io(&path)(e)),
            }
        }
    }

    fn read_next_index(&self, dir: &Path) -> Option<u64> {
        let path = dir.join(NEXT_INDEX_FILE);
        let raw = fs::read_to_string(&path).ok()?;
        match raw.trim().parse() {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable index counter");
                None
            }
        }
    }

    /// Persist the counter past `claimed`. The image is already stored, so
    /// a failure here only costs a rescan on the next append.
    fn record_next_index(&self, name: &IdentityName, claimed: u64) {
        // The last index has no successor; the next claim fails on the scan.
        let Some(next) = claimed.checked_add(1) else {
            return;
        };
        let path = self.identity_dir(name).join(NEXT_INDEX_FILE);
        if let Err(e) = write_atomic(&path, next.to_string().as_bytes()) {
            tracing::warn!(name = %name, error = %e, "failed to persist index counter");
        }
    }
}

fn index_exhausted(dir: &Path) -> GalleryError {
    GalleryError::io(dir)(io::Error::other("image index space exhausted"))
}

/// Rename `from` to `to`, copying instead when they sit on different
/// filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            tracing::debug!(from = %from.display(), to = %to.display(), "cross-device move, copying");
            copy_then_remove(from, to)
        }
        other => other,
    }
}

/// Copy `from` over `to`, flush it, then delete `from`. `from` survives
/// any failure.
fn copy_then_remove(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to)?;
    File::open(to)?.sync_all()?;
    fs::remove_file(from)
}

fn image_file_name(index: u64) -> String {
    format!("{IMAGE_PREFIX}{index}.{IMAGE_EXT}")
}

fn parse_image_index(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(IMAGE_PREFIX)?
        .strip_suffix(IMAGE_EXT)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

/// Write to a sibling temp file, fsync, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), GalleryError> {
    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    let mut file = File::create(&temp_path).map_err(GalleryError::io(&temp_path))?;
    file.write_all(contents)
        .and_then(|()| file.sync_all())
        .map_err(GalleryError::io(&temp_path))?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        GalleryError::io(path)(e)
    })
}
