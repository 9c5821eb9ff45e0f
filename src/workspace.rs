//! Per-process scratch directory.

use nix::unistd::{getpid, Pid};
use std::fs::Permissions;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::signals;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("cannot determine current directory: {0}")]
    CurrentDir(#[source] io::Error),
    #[error("failed to create workspace {path}: {source}")]
    Create { path: PathBuf, source: io::Error },
    #[error("failed to enter workspace {path}: {source}")]
    Enter { path: PathBuf, source: io::Error },
    #[error("failed to remove workspace {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },
}

/// A uniquely named directory that exists for the lifetime of a test run.
///
/// The name is `<base>.<pid>`, so concurrently running copies never collide.
/// Only the process that created it removes it; a forked child holding a copy
/// of this value leaves the directory alone.
#[derive(Debug)]
pub struct TempWorkspace {
    path: PathBuf,
    dir: Option<TempDir>,
    owner: Pid,
    previous_dir: Option<PathBuf>,
}

impl TempWorkspace {
    /// Creates `<cwd>/<base>.<pid>` and makes it the current directory.
    pub fn create(base: &str) -> Result<Self, WorkspaceError> {
        let cwd = std::env::current_dir().map_err(WorkspaceError::CurrentDir)?;
        let mut workspace = Self::create_at(&cwd, base, getpid())?;
        workspace.enter()?;
        Ok(workspace)
    }

    /// Creates `<parent>/<base>.<pid>` without changing directory.
    pub fn create_at(parent: &Path, base: &str, pid: Pid) -> Result<Self, WorkspaceError> {
        let name = Self::dir_name(base, pid);
        let dir = tempfile::Builder::new()
            .prefix(&name)
            .rand_bytes(0)
            .permissions(Permissions::from_mode(0o700))
            .tempdir_in(parent)
            .map_err(|source| WorkspaceError::Create {
                path: parent.join(&name),
                source,
            })?;
        let path = dir.path().to_path_buf();
        info!("created workspace {}", path.display());
        Ok(Self {
            path,
            dir: Some(dir),
            owner: getpid(),
            previous_dir: None,
        })
    }

    pub fn dir_name(base: &str, pid: Pid) -> String {
        format!("{base}.{pid}")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Makes the workspace the current directory, remembering where we were.
    pub fn enter(&mut self) -> Result<(), WorkspaceError> {
        let previous = std::env::current_dir().map_err(WorkspaceError::CurrentDir)?;
        std::env::set_current_dir(&self.path).map_err(|source| WorkspaceError::Enter {
            path: self.path.clone(),
            source,
        })?;
        self.previous_dir.get_or_insert(previous);
        debug!("entered workspace {}", self.path.display());
        Ok(())
    }

    /// Leaves the directory if we are in it and removes it with everything
    /// the test left behind.
    pub fn destroy(mut self) -> Result<(), WorkspaceError> {
        self.remove()
    }

    fn remove(&mut self) -> Result<(), WorkspaceError> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        if self.owner != getpid() {
            // The owner's copy of this value does the removal.
            let _ = dir.keep();
            return Ok(());
        }
        signals::register_fault_workspace(None);

        if let Some(previous) = self.previous_dir.take() {
            if let Err(e) = std::env::set_current_dir(&previous) {
                warn!("cannot return to {}: {}", previous.display(), e);
                let _ = std::env::set_current_dir("/");
            }
        }

        match dir.close() {
            Ok(()) => {
                info!("removed workspace {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(WorkspaceError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for TempWorkspace {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!("workspace cleanup on drop failed: {}", e);
        }
    }
}
