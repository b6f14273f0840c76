use crate::policy::{escapes_root, normalize_path};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Keeps patch targets inside the workspace root.
///
/// Paths from a patch are checked twice: lexically (absolute paths and `..`
/// climbing above the root) and physically, by canonicalizing the nearest
/// existing ancestor so a symlinked directory cannot redirect a write.
#[derive(Debug, Clone)]
pub struct WorkspaceGuard {
    /// Canonical workspace root
    workspace_root: PathBuf,
}

#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("Path is outside workspace: {path} (workspace: {workspace})")]
    OutsideWorkspace { path: PathBuf, workspace: PathBuf },

    #[error("Path escapes workspace lexically: {0}")]
    Escape(String),

    #[error("Failed to canonicalize path: {0}")]
    Canonicalize(#[from] std::io::Error),
}

impl WorkspaceGuard {
    /// The root is canonicalized so symlinked workspaces compare correctly.
    pub fn new(workspace_root: impl AsRef<Path>) -> Result<Self, SafetyError> {
        let workspace_root = workspace_root.as_ref().canonicalize()?;
        Ok(Self { workspace_root })
    }

    /// Resolve a workspace-relative patch path to an absolute one.
    ///
    /// The target need not exist yet; its nearest existing ancestor must
    /// resolve inside the root.
    pub fn validate_path(&self, relative: &str) -> Result<PathBuf, SafetyError> {
        let normalized = normalize_path(relative);
        if normalized.is_empty() || escapes_root(&normalized) {
            return Err(SafetyError::Escape(relative.to_string()));
        }

        let absolute = self.workspace_root.join(normalized.trim_end_matches('/'));
        let anchor = nearest_existing(&absolute);
        let canonical = anchor.canonicalize()?;
        self.check_canonical(&canonical)?;

        Ok(absolute)
    }

    fn check_canonical(&self, canonical: &Path) -> Result<(), SafetyError> {
        if !canonical.starts_with(&self.workspace_root) {
            return Err(SafetyError::OutsideWorkspace {
                path: canonical.to_path_buf(),
                workspace: self.workspace_root.clone(),
            });
        }
        Ok(())
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }
}

/// `path` itself if it exists (symlinks included), else its closest
/// existing parent.
fn nearest_existing(path: &Path) -> &Path {
    let mut current = path;
    loop {
        if current.symlink_metadata().is_ok() {
            return current;
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return current,
        }
    }
}
