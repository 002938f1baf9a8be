//! Filesystem confinement for tool I/O.
//!
//! Every user-visible file operation resolves its path through [`PathGuard`],
//! which pins the result under a single sandbox root. Symlinks and `..`
//! components are resolved before the containment check.

pub mod patch;

use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::AgentError;

#[derive(Debug, Clone)]
pub struct PathGuard {
    /// Canonicalized sandbox root. All validated paths start with this.
    root: PathBuf,
}

impl PathGuard {
    /// Resolve `base_dir` against the server working directory, creating it
    /// if absent, and canonicalize it as the containment root.
    pub fn new(base_dir: &Path) -> Result<Self, AgentError> {
        fs::create_dir_all(base_dir)
            .map_err(|e| AgentError::StoreError(format!("cannot create sandbox dir: {}", e)))?;
        let root = fs::canonicalize(base_dir)
            .map_err(|e| AgentError::StoreError(format!("cannot resolve sandbox dir: {}", e)))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a user-supplied path to an absolute path under the sandbox
    /// root, or fail with `PathEscape`.
    ///
    /// The target file may not exist yet (writes), so the nearest existing
    /// ancestor is canonicalized and the remaining components are re-joined
    /// before the prefix check.
    pub fn safe_path(&self, user_path: &str) -> Result<PathBuf, AgentError> {
        if user_path.trim().is_empty() {
            return Err(AgentError::InvalidArgument(
                "path must not be empty".to_string(),
            ));
        }

        let requested = Path::new(user_path);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };

        let (canonical_ancestor, remainder) = canonicalize_ancestor(&joined)?;
        let resolved = canonical_ancestor.join(&remainder);

        if !resolved.starts_with(&self.root) {
            warn!(
                "Path access denied — outside sandbox: {} (resolved: {})",
                user_path,
                resolved.display()
            );
            return Err(AgentError::PathEscape(user_path.to_string()));
        }
        Ok(resolved)
    }

    /// Like [`safe_path`](Self::safe_path), but additionally requires the
    /// target to exist.
    pub fn safe_existing_path(&self, user_path: &str) -> Result<PathBuf, AgentError> {
        let path = self.safe_path(user_path)?;
        if !path.exists() {
            return Err(AgentError::NotFound(format!("File not found: {}", user_path)));
        }
        Ok(path)
    }
}

/// Walk up from `path` to the nearest existing ancestor, canonicalize it,
/// and return the remaining suffix. This resolves symlinks in the existing
/// portion while still validating paths whose leaf does not exist yet.
fn canonicalize_ancestor(path: &Path) -> Result<(PathBuf, PathBuf), AgentError> {
    let mut current = path.to_path_buf();
    let mut suffix_parts: Vec<std::ffi::OsString> = Vec::new();

    loop {
        match fs::canonicalize(&current) {
            Ok(canonical) => {
                let mut remainder = PathBuf::new();
                for part in suffix_parts.into_iter().rev() {
                    remainder.push(part);
                }
                return Ok((canonical, remainder));
            }
            Err(_) => {
                if let Some(file_name) = current.file_name() {
                    // `..` in the unresolved suffix would sidestep the
                    // prefix check after re-joining; reject it outright.
                    if file_name == ".." {
                        return Err(AgentError::PathEscape(path.display().to_string()));
                    }
                    suffix_parts.push(file_name.to_os_string());
                }
                if !current.pop() {
                    return Err(AgentError::NotFound(format!(
                        "cannot resolve any ancestor of {}",
                        path.display()
                    )));
                }
            }
        }
    }
}
