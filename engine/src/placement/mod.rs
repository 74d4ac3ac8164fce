//! Idempotent placement into the curated tree
//!
//! Every write made by the curation pass goes through a [`PlacementGuard`]
//! and one of the functions here. Images are copied, never moved, and an
//! existing image is never overwritten: identical content is left alone and
//! different content is a [`CurateError::NameCollision`]. Sidecars are
//! rewritten only when their bytes would change.
//!
//! Writes go to a temporary sibling first and are renamed into place, so an
//! interrupted run never leaves a truncated file under a canonical name.

use crate::dataset::{pretty_json, RESERVED_DIRS};
use sdk::errors::CurateError;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

/// Outcome of one placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceOutcome {
    Created,
    Updated,
    Unchanged,
}

impl PlaceOutcome {
    pub fn wrote(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Keeps curation writes inside the dataset and out of its reserved directories.
///
/// # Validation
///
/// 1. Reject `.` and `..` components before touching the filesystem
/// 2. Canonicalize the nearest existing ancestor, so a symlinked directory
///    cannot redirect a write
/// 3. Require the resolved path to sit under the dataset root
/// 4. Reject reserved top-level directories (`sourcedata`, `work`, `code`, `derivatives`)
#[derive(Debug, Clone)]
pub struct PlacementGuard {
    root: PathBuf,
    protected: Vec<PathBuf>,
}

impl PlacementGuard {
    /// Create a guard for a dataset root.
    ///
    /// # Errors
    ///
    /// Returns `CurateError::DatasetRoot` if the root cannot be canonicalized.
    pub fn new(root: &Path) -> Result<Self, CurateError> {
        let root = root
            .canonicalize()
            .map_err(|_| CurateError::DatasetRoot(root.to_path_buf()))?;
        let protected = RESERVED_DIRS.iter().map(|d| root.join(d)).collect();
        Ok(Self { root, protected })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate a destination path that may not exist yet.
    pub fn validate_target(&self, path: &Path) -> Result<PathBuf, CurateError> {
        // Gate 1: lexical traversal check
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        {
            return Err(CurateError::PathOutsideDataset(path.to_path_buf()));
        }

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        // Gate 2: resolve symlinks on whatever part already exists
        let mut existing = absolute.as_path();
        while !existing.exists() {
            existing = match existing.parent() {
                Some(parent) => parent,
                None => break,
            };
        }
        let canonical = existing
            .canonicalize()
            .map_err(|_| CurateError::PathOutsideDataset(absolute.clone()))?;
        let resolved = match absolute.strip_prefix(existing) {
            Ok(rest) if !rest.as_os_str().is_empty() => canonical.join(rest),
            _ => canonical,
        };

        // Gates 3 and 4
        self.check_inside(&resolved)?;

        Ok(resolved)
    }

    fn check_inside(&self, path: &Path) -> Result<(), CurateError> {
        if !path.starts_with(&self.root) || path == self.root {
            return Err(CurateError::PathOutsideDataset(path.to_path_buf()));
        }
        if let Some(dir) = self.protected.iter().find(|dir| path.starts_with(dir)) {
            return Err(CurateError::PathProtected(dir.clone()));
        }
        Ok(())
    }
}

/// SHA-256 of a file's contents.
pub fn content_hash(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Whether two files hold identical bytes. Sizes are compared before hashing.
pub fn same_content(a: &Path, b: &Path) -> io::Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }
    Ok(content_hash(a)? == content_hash(b)?)
}

/// Copy `source` to `dest` unless an identical file is already there.
///
/// # Errors
///
/// Returns `CurateError::NameCollision` if `dest` exists with different content.
pub fn place_file(
    guard: &PlacementGuard,
    source: &Path,
    dest: &Path,
) -> Result<PlaceOutcome, CurateError> {
    let dest = guard.validate_target(dest)?;

    if dest.exists() {
        if same_content(source, &dest)? {
            return Ok(PlaceOutcome::Unchanged);
        }
        return Err(CurateError::NameCollision(format!(
            "{} already exists with different content",
            dest.display()
        )));
    }

    let tmp = staging_path(&dest)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, &tmp)?;
    fs::rename(&tmp, &dest)?;

    if let Ok(digest) = content_hash(&dest) {
        tracing::debug!("Placed {} (sha256 {})", dest.display(), &hex::encode(digest)[..12]);
    }
    Ok(PlaceOutcome::Created)
}

/// Write `contents` to `dest` unless the file already holds exactly those bytes.
pub fn write_if_changed(
    guard: &PlacementGuard,
    dest: &Path,
    contents: &[u8],
) -> Result<PlaceOutcome, CurateError> {
    let dest = guard.validate_target(dest)?;

    let outcome = match fs::read(&dest) {
        Ok(current) if current == contents => return Ok(PlaceOutcome::Unchanged),
        Ok(_) => PlaceOutcome::Updated,
        Err(e) if e.kind() == io::ErrorKind::NotFound => PlaceOutcome::Created,
        Err(e) => return Err(e.into()),
    };

    write_atomic(&dest, contents)?;
    Ok(outcome)
}

/// Write `contents` through a `.partial` sibling renamed over `dest`.
///
/// No guard check: callers writing inside the dataset tree go through
/// [`write_if_changed`].
pub fn write_atomic(dest: &Path, contents: &[u8]) -> Result<(), CurateError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = staging_path(dest)?;
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, dest)?;
    Ok(())
}

/// Write a JSON sidecar (4-space indented, trailing newline) if its content changed.
pub fn write_sidecar(
    guard: &PlacementGuard,
    dest: &Path,
    value: &serde_json::Value,
) -> Result<PlaceOutcome, CurateError> {
    let text = pretty_json(value).map_err(|e| match e {
        CurateError::Sidecar(_, reason) => CurateError::Sidecar(dest.to_path_buf(), reason),
        other => other,
    })?;
    write_if_changed(guard, dest, text.as_bytes())
}

/// Create a file with `contents` only if nothing exists at `dest`.
pub fn write_if_missing(
    guard: &PlacementGuard,
    dest: &Path,
    contents: &[u8],
) -> Result<PlaceOutcome, CurateError> {
    let checked = guard.validate_target(dest)?;
    if checked.exists() {
        return Ok(PlaceOutcome::Unchanged);
    }
    write_if_changed(guard, &checked, contents)
}

fn staging_path(dest: &Path) -> Result<PathBuf, CurateError> {
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CurateError::PathOutsideDataset(dest.to_path_buf()))?;
    Ok(dest.with_file_name(format!(".{}.partial", name)))
}
