//! Filesystem confinement.
//!
//! Requested paths are resolved to their canonical form (following every
//! symlink) and only then compared against the canonical root. The target
//! must be a regular file or a directory.

use na_domain::error::ToolError;
use std::ffi::OsString;
use std::fs::FileType;
use std::path::{Component, Path, PathBuf};

/// What the caller intends to do with the resolved path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The target must already exist.
    Existing,
    /// The target may be created. Its nearest existing ancestor is resolved
    /// instead and the remaining components are appended.
    Create,
}

#[derive(Debug, Clone)]
pub struct FsSandbox {
    root: PathBuf,
}

impl FsSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `requested` (relative to the root, or absolute) to a path
    /// that is guaranteed to stay under the root.
    pub fn resolve(&self, requested: &str, access: Access) -> Result<PathBuf, ToolError> {
        if requested.trim().is_empty() {
            return Err(ToolError::validation("path must not be empty"));
        }
        let requested_path = Path::new(requested);
        if requested_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(ToolError::sandbox("path must not contain '..' components"));
        }

        let canonical_root = self.root.canonicalize().map_err(|e| {
            ToolError::execution(format!(
                "cannot resolve workspace root '{}': {e}",
                self.root.display()
            ))
        })?;

        let candidate = if requested_path.is_absolute() {
            requested_path.to_path_buf()
        } else {
            canonical_root.join(requested_path)
        };

        let resolved = match std::fs::symlink_metadata(&candidate) {
            Ok(_) => candidate.canonicalize().map_err(|e| {
                // A dangling symlink lands here: there is nothing to confine.
                ToolError::sandbox(format!("cannot resolve '{requested}': {e}"))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => match access {
                Access::Existing => {
                    return Err(ToolError::execution(format!("'{requested}' does not exist")))
                }
                Access::Create => resolve_via_ancestor(&candidate, requested)?,
            },
            Err(e) => {
                return Err(ToolError::execution(format!("cannot stat '{requested}': {e}")))
            }
        };

        if !resolved.starts_with(&canonical_root) {
            return Err(ToolError::sandbox(format!(
                "path '{requested}' resolves outside the allowed root"
            )));
        }

        if let Ok(meta) = std::fs::metadata(&resolved) {
            check_file_type(meta.file_type(), requested)?;
        }

        Ok(resolved)
    }
}

/// Walk up to the nearest existing ancestor, canonicalize it, and re-append
/// the missing tail.
fn resolve_via_ancestor(candidate: &Path, requested: &str) -> Result<PathBuf, ToolError> {
    let mut existing = candidate;
    let mut tail: Vec<OsString> = Vec::new();
    loop {
        if std::fs::symlink_metadata(existing).is_ok() {
            break;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }

    let mut resolved = existing
        .canonicalize()
        .map_err(|e| ToolError::sandbox(format!("cannot resolve ancestor of '{requested}': {e}")))?;
    if !resolved.is_dir() {
        return Err(ToolError::execution(format!(
            "'{}' is not a directory",
            existing.display()
        )));
    }
    for part in tail.into_iter().rev() {
        resolved.push(part);
    }
    Ok(resolved)
}

fn check_file_type(ft: FileType, requested: &str) -> Result<(), ToolError> {
    if ft.is_file() || ft.is_dir() {
        Ok(())
    } else {
        Err(ToolError::sandbox(format!(
            "'{requested}' is not a regular file or directory"
        )))
    }
}
