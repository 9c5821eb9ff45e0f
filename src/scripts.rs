//! Companion scripts shipped next to the test binaries.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::environment::Environment;

/// Variable naming the root of the installed test tree.
pub const ROOT_VAR: &str = "LTPROOT";

const SCRIPT_DIR: &str = "testcases/bin";

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("LTPROOT is not set")]
    MissingRoot,
    #[error("script {0} not found")]
    NotFound(PathBuf),
    #[error("failed to run {path}: {source}")]
    Spawn { path: PathBuf, source: io::Error },
}

/// Runs helper scripts and reports pass/fail from their exit status.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    root: PathBuf,
    env: Environment,
}

impl ScriptRunner {
    /// Locates scripts under `$LTPROOT/testcases/bin`; scripts inherit `env`.
    pub fn from_env(env: Environment) -> Result<Self, ScriptError> {
        let root = env
            .get(ROOT_VAR)
            .filter(|r| !r.is_empty())
            .map(PathBuf::from)
            .ok_or(ScriptError::MissingRoot)?;
        Ok(Self { root, env })
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            env: Environment::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn script_path(&self, name: &str) -> PathBuf {
        self.root.join(SCRIPT_DIR).join(name)
    }

    /// Runs `name` with `args`; `Ok(true)` when it exits 0.
    ///
    /// A script killed by a signal counts as a failure, not an error.
    pub fn run<S: AsRef<str>>(&self, name: &str, args: &[S]) -> Result<bool, ScriptError> {
        let path = self.script_path(name);
        if !path.is_file() {
            return Err(ScriptError::NotFound(path));
        }

        debug!("running {} with {} args", path.display(), args.len());
        let status = Command::new(&path)
            .args(args.iter().map(AsRef::as_ref))
            .env_clear()
            .envs(self.env.iter())
            .stdin(Stdio::null())
            .status()
            .map_err(|source| ScriptError::Spawn {
                path: path.clone(),
                source,
            })?;

        if status.success() {
            info!("{} passed", name);
        } else {
            warn!("{} failed: {}", name, status);
        }
        Ok(status.success())
    }
}
