//! Sandboxed resolution of remote paths.
//!
//! Remote paths are untrusted. A path is accepted only if it lands inside the
//! canonical root, checked in three layers:
//!
//! 1. **Normalisation**: `.` and `..` are folded lexically; climbing above the
//!    root is rejected before touching the filesystem
//! 2. **Ancestor check**: the candidate must be a component-wise descendant of
//!    the root (`/data` never matches `/data2`)
//! 3. **Symlink check**: the deepest existing ancestor is canonicalised and
//!    re-checked, so links pointing out of the root are rejected
//!
//! Leading separators are ignored: `/docs/a.txt` names `<root>/docs/a.txt`.

use crate::error::FileError;
use std::path::{Component, Path, PathBuf};

/// A canonical root directory that remote paths are confined to.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Open a sandbox at `root`, creating the directory if it is missing.
    ///
    /// # Errors
    /// Returns `FileError::InvalidRoot` if the directory cannot be created or
    /// canonicalised.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, FileError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|source| FileError::InvalidRoot {
            path: root.to_path_buf(),
            source,
        })?;
        let root = root.canonicalize().map_err(|source| FileError::InvalidRoot {
            path: root.to_path_buf(),
            source,
        })?;
        Ok(Self { root })
    }

    /// The canonical root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an untrusted remote path to a location inside the root.
    ///
    /// The returned path need not exist yet.
    ///
    /// # Errors
    /// - `FileError::InvalidPath` for empty paths, NUL bytes, or paths that
    ///   name the root itself
    /// - `FileError::Traversal` for paths that escape the root lexically or
    ///   through a symlink
    /// - `FileError::Io` if an existing ancestor cannot be canonicalised
    pub fn resolve(&self, remote_path: &str) -> Result<PathBuf, FileError> {
        if remote_path.is_empty() || remote_path.contains('\0') {
            return Err(FileError::InvalidPath(remote_path.to_string()));
        }

        let relative = normalize(remote_path)?;
        if relative.as_os_str().is_empty() {
            return Err(FileError::InvalidPath(remote_path.to_string()));
        }

        let candidate = self.root.join(&relative);
        if !candidate.starts_with(&self.root) {
            return Err(FileError::Traversal(remote_path.to_string()));
        }

        let (existing, rest) = deepest_existing(&candidate);
        let canonical = existing
            .canonicalize()
            .map_err(|e| FileError::io(existing, e))?;
        if !canonical.starts_with(&self.root) {
            tracing::warn!(
                "Rejected {:?}: resolves to {} outside {}",
                remote_path,
                canonical.display(),
                self.root.display()
            );
            return Err(FileError::Traversal(remote_path.to_string()));
        }

        // Joining an empty remainder would append a trailing separator.
        if rest.as_os_str().is_empty() {
            Ok(canonical)
        } else {
            Ok(canonical.join(rest))
        }
    }

    /// Whether `path` is the root or lies beneath it
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}

/// Fold `.` and `..` without touching the filesystem.
fn normalize(remote_path: &str) -> Result<PathBuf, FileError> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(remote_path).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(FileError::Traversal(remote_path.to_string()));
                }
            }
            Component::Prefix(_) => return Err(FileError::Traversal(remote_path.to_string())),
        }
    }
    Ok(parts.iter().collect())
}

/// Split `path` into its deepest existing ancestor and the missing remainder.
fn deepest_existing(path: &Path) -> (&Path, PathBuf) {
    let mut existing = path;
    let mut missing = Vec::new();
    while existing.symlink_metadata().is_err() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                existing = parent;
            }
            _ => break,
        }
    }
    (existing, missing.iter().rev().collect())
}
