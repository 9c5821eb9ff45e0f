use anyhow::{Context, Result};
use nix::{sys::signal::Signal, unistd::Pid};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::time::timeout;

/// Variables the harness reads that must not leak in from the test runner.
const SCRUBBED_VARS: &[&str] = &[
    "USC_ITERATIONS",
    "USC_NO_FUNC_CHECK",
    "USC_LOOP_WALLTIME",
    "USC_DURATION",
    "USC_LOOP_DELAY",
    "USC_COPIES",
    "TOUTPUT",
    "RUST_LOG",
];

/// Runs the probe binary inside a private scratch directory.
pub struct ProbeHarness {
    probe_binary: PathBuf,
    temp_dir: TempDir,
    environment: HashMap<String, String>,
    cleanup_pids: Vec<Pid>,
}

impl ProbeHarness {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        Ok(Self {
            probe_binary: PathBuf::from(env!("CARGO_BIN_EXE_kharness-probe")),
            temp_dir,
            environment: HashMap::new(),
            cleanup_pids: Vec::new(),
        })
    }

    /// Set an environment variable for spawned probes
    pub fn set_environment(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.environment.insert(key.into(), value.into());
    }

    /// Directory the probe runs in; its workspace is created below it.
    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Names of everything left in the probe's working directory.
    pub fn leftovers(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.temp_path())? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    pub async fn spawn_probe(&mut self, args: &[&str]) -> Result<ProbeProcess> {
        let mut cmd = Command::new(&self.probe_binary);
        cmd.args(args)
            .current_dir(self.temp_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for var in SCRUBBED_VARS {
            cmd.env_remove(var);
        }
        for (key, value) in &self.environment {
            cmd.env(key, value);
        }

        let start_time = Instant::now();
        let child = cmd.spawn().context("Failed to spawn probe")?;
        let pid = Pid::from_raw(
            child
                .id()
                .ok_or_else(|| anyhow::anyhow!("Failed to get probe PID"))? as i32,
        );
        self.cleanup_pids.push(pid);

        Ok(ProbeProcess {
            pid,
            start_time,
            child: Some(child),
        })
    }

    /// Spawns the probe and collects its output.
    pub async fn run_probe(&mut self, args: &[&str], limit: Duration) -> Result<ProbeOutput> {
        let process = self.spawn_probe(args).await?;
        process.finish(limit).await
    }
}

impl Drop for ProbeHarness {
    fn drop(&mut self) {
        for pid in &self.cleanup_pids {
            let _ = nix::sys::signal::kill(*pid, Signal::SIGKILL);
        }
    }
}

/// A running probe.
pub struct ProbeProcess {
    pub pid: Pid,
    pub start_time: Instant,
    child: Option<tokio::process::Child>,
}

impl ProbeProcess {
    pub fn is_running(&mut self) -> bool {
        match &mut self.child {
            Some(child) => child.try_wait().unwrap_or(None).is_none(),
            None => false,
        }
    }

    pub fn signal(&self, signal: Signal) -> Result<()> {
        nix::sys::signal::kill(self.pid, signal).context("Failed to signal probe")
    }

    pub fn runtime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Waits for exit and returns everything the probe printed.
    pub async fn finish(mut self, limit: Duration) -> Result<ProbeOutput> {
        let child = self
            .child
            .take()
            .ok_or_else(|| anyhow::anyhow!("Probe already collected"))?;
        let output = timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("Probe did not exit within {:?}", limit))?
            .context("Probe wait failed")?;
        Ok(ProbeOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Debug)]
pub struct ProbeOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ProbeOutput {
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}
