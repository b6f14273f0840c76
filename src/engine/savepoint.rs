use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SavepointError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`git {args}` failed: {stderr}")]
    Git { args: String, stderr: String },

    #[error("No savepoint has been created")]
    NotCreated,
}

/// Whole-workspace checkpoint taken before a patch is applied.
pub trait Savepoint {
    fn create(&mut self, workspace: &Path, label: &str) -> Result<(), SavepointError>;
    /// Return the workspace to the checkpoint and drop it.
    fn rollback(&mut self, workspace: &Path) -> Result<(), SavepointError>;
    /// Drop the checkpoint, keeping the current working tree.
    fn release(&mut self, workspace: &Path) -> Result<(), SavepointError>;
}

/// Checkpoint as a throwaway commit on top of the current `HEAD`.
///
/// `release` moves `HEAD` back with a mixed reset, so the working tree is
/// kept and the index no longer holds the snapshot.
#[derive(Debug, Clone)]
pub struct GitSavepoint {
    program: String,
    state: Option<Checkpoint>,
}

#[derive(Debug, Clone)]
struct Checkpoint {
    commit: String,
    /// `None` when the repository had no commits yet.
    previous_head: Option<String>,
}

impl Default for GitSavepoint {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitSavepoint {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            state: None,
        }
    }

    fn git(&self, workspace: &Path, args: &[&str]) -> Result<String, SavepointError> {
        let output = Command::new(&self.program)
            .current_dir(workspace)
            .args(args)
            .output()
            .map_err(|source| SavepointError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(SavepointError::Git {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn detach(&mut self, workspace: &Path) -> Result<(), SavepointError> {
        let checkpoint = self.state.take().ok_or(SavepointError::NotCreated)?;
        match checkpoint.previous_head.as_deref() {
            Some(head) => self.git(workspace, &["reset", "--mixed", "--quiet", head])?,
            None => self.git(workspace, &["update-ref", "-d", "HEAD"])?,
        };
        Ok(())
    }
}

impl Savepoint for GitSavepoint {
    fn create(&mut self, workspace: &Path, label: &str) -> Result<(), SavepointError> {
        let previous_head = self.git(workspace, &["rev-parse", "--verify", "HEAD"]).ok();
        self.git(workspace, &["add", "-A"])?;
        self.git(
            workspace,
            &[
                "-c",
                "user.name=patchgate",
                "-c",
                "user.email=patchgate@localhost",
                "commit",
                "--allow-empty",
                "--no-verify",
                "--quiet",
                "-m",
                label,
            ],
        )?;
        let commit = self.git(workspace, &["rev-parse", "HEAD"])?;
        debug!(commit = %commit, "savepoint created");

        self.state = Some(Checkpoint {
            commit,
            previous_head,
        });
        Ok(())
    }

    fn rollback(&mut self, workspace: &Path) -> Result<(), SavepointError> {
        let commit = self
            .state
            .as_ref()
            .map(|c| c.commit.clone())
            .ok_or(SavepointError::NotCreated)?;
        self.git(workspace, &["reset", "--hard", "--quiet", &commit])?;
        self.git(workspace, &["clean", "-fd", "--quiet"])?;
        debug!(commit = %commit, "rolled back to savepoint");
        self.detach(workspace)
    }

    fn release(&mut self, workspace: &Path) -> Result<(), SavepointError> {
        self.detach(workspace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn init_repo() -> Option<tempfile::TempDir> {
        let dir = tempfile::tempdir().unwrap();
        let ok = Command::new("git")
            .current_dir(dir.path())
            .args(["init", "--quiet"])
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        ok.then_some(dir)
    }

    #[test]
    fn test_rollback_restores_tree_and_head() {
        let Some(dir) = init_repo() else {
            return;
        };
        let ws = dir.path();
        fs::write(ws.join("a.txt"), "before\n").unwrap();

        let mut savepoint = GitSavepoint::default();
        savepoint.create(ws, "patchgate savepoint").unwrap();

        fs::write(ws.join("a.txt"), "after\n").unwrap();
        fs::write(ws.join("stray.txt"), "x").unwrap();
        savepoint.rollback(ws).unwrap();

        assert_eq!(fs::read_to_string(ws.join("a.txt")).unwrap(), "before\n");
        assert!(!ws.join("stray.txt").exists());
        // Repository had no commits; HEAD is unborn again.
        assert!(savepoint.git(ws, &["rev-parse", "--verify", "HEAD"]).is_err());
    }

    #[test]
    fn test_release_keeps_changes() {
        let Some(dir) = init_repo() else {
            return;
        };
        let ws = dir.path();
        fs::write(ws.join("a.txt"), "before\n").unwrap();

        let mut savepoint = GitSavepoint::default();
        savepoint.create(ws, "patchgate savepoint").unwrap();
        fs::write(ws.join("a.txt"), "after\n").unwrap();
        savepoint.release(ws).unwrap();

        assert_eq!(fs::read_to_string(ws.join("a.txt")).unwrap(), "after\n");
        assert!(matches!(
            savepoint.release(ws),
            Err(SavepointError::NotCreated)
        ));
    }
}
