//! Path resolution and the immutable set of watched roots.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::core::errors::{IronDomeError, Result};

/// Resolve a path to an absolute, normalized path.
///
/// If `fs::canonicalize` succeeds (path exists), it is used to resolve symlinks
/// and normalize components.
///
/// If it fails (e.g. path does not exist), the path is made absolute relative
/// to CWD and `..`/`.` components are resolved syntactically.
pub fn resolve_absolute_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };

    if let Ok(canonical) = fs::canonicalize(&absolute) {
        return canonical;
    }

    normalize_syntactic(&absolute)
}

fn normalize_syntactic(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::Normal(_) => {
                components.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
        }
    }
    components.into_iter().collect()
}

// ──────────────────── watched paths ────────────────────

/// What a watched root points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PathKind {
    File,
    Directory,
}

/// A canonical absolute root the monitor counts reads for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WatchedPath {
    pub path: PathBuf,
    pub kind: PathKind,
}

impl WatchedPath {
    /// Whether `candidate` falls under this root.
    ///
    /// Directories match component-wise (`/data` covers `/data/x` but not
    /// `/database`); files match only themselves.
    pub fn covers(&self, candidate: &Path) -> bool {
        match self.kind {
            PathKind::Directory => candidate.starts_with(&self.path),
            PathKind::File => candidate == self.path,
        }
    }

    fn depth(&self) -> usize {
        self.path.components().count()
    }
}

impl fmt::Display for WatchedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Validated, immutable set of watched roots.
///
/// Order follows the command line; the index of a root is stable for the
/// life of the set and is what per-path counters are keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct WatchSet {
    roots: Vec<WatchedPath>,
}

impl WatchSet {
    /// Validate raw path arguments into a watch set.
    ///
    /// Rejects, in order: the same argument given twice, paths that do not
    /// exist, paths the process cannot read, entries that are neither a file
    /// nor a directory, and different spellings of the same canonical path.
    pub fn resolve<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let mut seen_args = HashSet::new();
        for arg in args {
            let arg = arg.as_ref();
            if !seen_args.insert(arg) {
                return Err(IronDomeError::DuplicatePath {
                    path: arg.to_string(),
                });
            }
        }

        let mut roots: Vec<WatchedPath> = Vec::with_capacity(args.len());
        for arg in args {
            let arg = arg.as_ref();
            let root = resolve_one(arg)?;
            if roots.iter().any(|existing| existing.path == root.path) {
                return Err(IronDomeError::DuplicatePath {
                    path: format!("{arg} (same as {})", root.path.display()),
                });
            }
            roots.push(root);
        }

        if roots.is_empty() {
            return Err(IronDomeError::NoWatchablePaths {
                details: "no paths were given and no default paths are configured".to_string(),
            });
        }
        Ok(Self { roots })
    }

    /// Build a set from already-validated roots.
    ///
    /// Callers are responsible for canonical, duplicate-free input.
    pub fn from_roots(roots: Vec<WatchedPath>) -> Self {
        Self { roots }
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&WatchedPath> {
        self.roots.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, WatchedPath> {
        self.roots.iter()
    }

    /// Most specific root covering `path`, with its index.
    pub fn attribute(&self, path: &Path) -> Option<(usize, &WatchedPath)> {
        self.roots
            .iter()
            .enumerate()
            .filter(|(_, root)| root.covers(path))
            .max_by_key(|(_, root)| root.depth())
    }

    /// Index of the root whose canonical path equals `path`.
    pub fn position(&self, path: &Path) -> Option<usize> {
        self.roots.iter().position(|root| root.path == path)
    }
}

impl<'a> IntoIterator for &'a WatchSet {
    type Item = &'a WatchedPath;
    type IntoIter = std::slice::Iter<'a, WatchedPath>;

    fn into_iter(self) -> Self::IntoIter {
        self.roots.iter()
    }
}

fn resolve_one(arg: &str) -> Result<WatchedPath> {
    let absolute = resolve_absolute_path(Path::new(arg));
    let metadata = match fs::metadata(&absolute) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(IronDomeError::PathNotFound { path: absolute });
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(IronDomeError::PermissionDenied { path: absolute });
        }
        Err(err) => return Err(IronDomeError::io(&absolute, err)),
    };

    if !is_readable(&absolute) {
        return Err(IronDomeError::PermissionDenied { path: absolute });
    }

    let kind = if metadata.is_dir() {
        PathKind::Directory
    } else if metadata.is_file() {
        PathKind::File
    } else {
        return Err(IronDomeError::InvalidConfig {
            details: format!(
                "path '{}' is neither a file nor a directory",
                absolute.display()
            ),
        });
    };

    let path = fs::canonicalize(&absolute).map_err(|err| IronDomeError::io(&absolute, err))?;
    Ok(WatchedPath { path, kind })
}

#[cfg(unix)]
fn is_readable(path: &Path) -> bool {
    nix::unistd::access(path, nix::unistd::AccessFlags::R_OK).is_ok()
}

#[cfg(not(unix))]
fn is_readable(path: &Path) -> bool {
    fs::metadata(path).is_ok()
}
