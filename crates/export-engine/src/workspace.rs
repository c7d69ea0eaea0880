//! Per-session temporary workspace.
//!
//! Every export session owns exactly one directory,
//! `<temp_root>/splice-export-<session-id>/`, holding intermediate files and
//! the in-progress output. The directory is removed in full when the guard is
//! dropped, on success, failure, cancellation and unwinding alike.

use std::path::{Path, PathBuf};

use splice_common::error::{SpliceError, SpliceResult};

/// Directory prefix of session workspaces.
pub const WORKSPACE_PREFIX: &str = "splice-export-";

/// Longest accepted session id.
const MAX_SESSION_ID_LEN: usize = 128;

/// Session ids name a single directory: ASCII letters, digits, `-` and `_`.
pub fn validate_session_id(session_id: &str) -> SpliceResult<()> {
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
        return Err(SpliceError::validation(format!(
            "session id must be 1-{MAX_SESSION_ID_LEN} characters"
        )));
    }
    if let Some(bad) = session_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(SpliceError::validation(format!(
            "session id {session_id:?} contains {bad:?}; only letters, digits, '-' and '_' are allowed"
        )));
    }
    Ok(())
}

/// RAII guard over a session workspace directory.
#[derive(Debug)]
pub struct SessionWorkspace {
    root: PathBuf,
}

impl SessionWorkspace {
    /// Workspace path for `session_id` under `temp_root`.
    pub fn path_for(temp_root: &Path, session_id: &str) -> PathBuf {
        temp_root.join(format!("{WORKSPACE_PREFIX}{session_id}"))
    }

    /// Create the workspace, retrying once on failure.
    ///
    /// A leftover directory from an earlier crashed session with the same id
    /// is cleared first.
    pub fn create(temp_root: &Path, session_id: &str) -> SpliceResult<Self> {
        validate_session_id(session_id)?;
        let root = Self::path_for(temp_root, session_id);
        if root.parent() != Some(temp_root) {
            return Err(SpliceError::validation(format!(
                "workspace {} is not directly under {}",
                root.display(),
                temp_root.display()
            )));
        }
        if root.exists() {
            tracing::warn!(path = %root.display(), "Removing stale export workspace");
            std::fs::remove_dir_all(&root).ok();
        }

        if let Err(first) = std::fs::create_dir_all(&root) {
            tracing::warn!(
                path = %root.display(),
                error = %first,
                "Workspace creation failed, retrying once"
            );
            std::fs::create_dir_all(&root).map_err(|e| {
                SpliceError::resource(format!(
                    "failed to create export workspace {}: {e}",
                    root.display()
                ))
            })?;
        }

        tracing::debug!(path = %root.display(), "Export workspace created");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a file inside the workspace.
    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// In-progress output file for the given container extension.
    pub fn output_path(&self, extension: &str) -> PathBuf {
        self.file(&format!("output.{extension}"))
    }
}

impl Drop for SessionWorkspace {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => tracing::debug!(path = %self.root.display(), "Export workspace removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.root.display(),
                error = %e,
                "Failed to remove export workspace"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("splice_test_workspace_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_workspace_is_removed_on_drop() {
        let root = temp_root("drop");
        let path = {
            let workspace = SessionWorkspace::create(&root, "abc").unwrap();
            std::fs::write(workspace.file("plan.txt"), "x").unwrap();
            assert_eq!(workspace.root(), root.join("splice-export-abc"));
            assert!(workspace.root().is_dir());
            workspace.root().to_path_buf()
        };
        assert!(!path.exists());
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_stale_workspace_is_cleared() {
        let root = temp_root("stale");
        let stale = SessionWorkspace::path_for(&root, "abc");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("output.mp4"), "old").unwrap();

        let workspace = SessionWorkspace::create(&root, "abc").unwrap();
        assert!(!workspace.output_path("mp4").exists());
        drop(workspace);
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_session_id_cannot_leave_temp_root() {
        let base = temp_root("escape");
        let root = base.join("tmp");
        std::fs::create_dir_all(&root).unwrap();
        let neighbour = base.join("victim");
        std::fs::create_dir_all(&neighbour).unwrap();
        std::fs::write(neighbour.join("keep.txt"), "keep").unwrap();

        for id in ["x/../../victim", "../victim", "a/b", "", "dot.dot", "sp ace"] {
            let err = SessionWorkspace::create(&root, id).unwrap_err();
            assert!(matches!(err, SpliceError::Validation { .. }), "{id:?}");
        }
        assert!(neighbour.join("keep.txt").exists());
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
        std::fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn test_session_id_charset() {
        assert!(validate_session_id("5f0c2b7e-1a2b-4c3d-9e8f-001122334455").is_ok());
        assert!(validate_session_id("export_01").is_ok());
        assert!(validate_session_id(&"a".repeat(129)).is_err());
        assert!(validate_session_id("a\\b").is_err());
    }

    #[test]
    fn test_unwritable_root_is_resource_error() {
        let root = temp_root("blocked");
        let blocker = root.join("file");
        std::fs::write(&blocker, "not a dir").unwrap();
        let err = SessionWorkspace::create(&blocker, "abc").unwrap_err();
        assert!(matches!(err, SpliceError::Resource { .. }));
        std::fs::remove_dir_all(&root).ok();
    }
}
