use super::ApplyMode;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{mode} apply rejected: {stderr}")]
    Rejected { mode: ApplyMode, stderr: String },

    #[error("{mode} apply timed out after {secs}s")]
    TimedOut { mode: ApplyMode, secs: u64 },
}

/// The external program that actually applies a diff file.
///
/// `check` must not touch the working tree; `apply` may only change the files
/// named by the patch.
pub trait ApplyTool {
    fn check(&self, workspace: &Path, patch_file: &Path, mode: ApplyMode) -> Result<(), ToolError>;
    fn apply(&self, workspace: &Path, patch_file: &Path, mode: ApplyMode) -> Result<(), ToolError>;
}

/// `git apply` run from the workspace root.
#[derive(Debug, Clone)]
pub struct GitApply {
    program: String,
    timeout: Option<Duration>,
}

impl Default for GitApply {
    fn default() -> Self {
        Self::new("git", None)
    }
}

impl GitApply {
    pub fn new(program: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn run(
        &self,
        workspace: &Path,
        patch_file: &Path,
        mode: ApplyMode,
        dry_run: bool,
    ) -> Result<(), ToolError> {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(workspace).arg("apply");
        if dry_run {
            cmd.arg("--check");
        }
        cmd.args(mode.flags()).arg(patch_file);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!(mode = %mode, dry_run, "running git apply");

        let spawn_error = |source| ToolError::Spawn {
            program: self.program.clone(),
            source,
        };
        let mut child = cmd.spawn().map_err(spawn_error)?;

        // Drained concurrently so a chatty child cannot fill the pipe and
        // stall before exiting.
        let reader = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });
        let collect_stderr = |reader: Option<thread::JoinHandle<Vec<u8>>>| {
            reader
                .and_then(|handle| handle.join().ok())
                .map(|buf| String::from_utf8_lossy(&buf).trim().to_string())
                .unwrap_or_default()
        };

        let status = match self.timeout {
            None => child.wait(),
            Some(limit) => {
                let started = Instant::now();
                loop {
                    match child.try_wait() {
                        Ok(Some(status)) => break Ok(status),
                        Ok(None) if started.elapsed() >= limit => {
                            let _ = child.kill();
                            let _ = child.wait();
                            collect_stderr(reader);
                            return Err(ToolError::TimedOut {
                                mode,
                                secs: limit.as_secs(),
                            });
                        }
                        Ok(None) => thread::sleep(Duration::from_millis(25)),
                        Err(e) => break Err(e),
                    }
                }
            }
        }
        .map_err(spawn_error)?;

        let stderr = collect_stderr(reader);
        if status.success() {
            return Ok(());
        }
        Err(ToolError::Rejected { mode, stderr })
    }
}

impl ApplyTool for GitApply {
    fn check(&self, workspace: &Path, patch_file: &Path, mode: ApplyMode) -> Result<(), ToolError> {
        self.run(workspace, patch_file, mode, true)
    }

    fn apply(&self, workspace: &Path, patch_file: &Path, mode: ApplyMode) -> Result<(), ToolError> {
        self.run(workspace, patch_file, mode, false)
    }
}
