//! Test command execution
//!
//! Runs a generated command line through the platform shell. The child gets
//! its own process group so that cancelling the run takes down everything
//! the shell started, not just the shell.

use anyhow::{Context, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// How a command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub success: bool,
    pub code: Option<i32>,
}

/// Executes one cycle's command line and waits for it.
///
/// Dropping the returned future before it completes must terminate the child.
pub trait CommandRunner: Send {
    fn run(&mut self, command: &str) -> impl Future<Output = Result<RunOutcome>> + Send;
}

/// `line` run by the platform shell
pub fn shell_command(line: &str) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C");
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c");
        c
    };
    cmd.arg(line);
    cmd
}

#[derive(Debug, Clone)]
pub struct ShellRunner {
    root: PathBuf,
    env: Vec<(String, String)>,
}

impl ShellRunner {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            env: Vec::new(),
        }
    }

    /// Extra environment for every spawned child
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self, line: &str) -> Command {
        let mut cmd = shell_command(line);
        cmd.current_dir(&self.root)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

impl CommandRunner for ShellRunner {
    async fn run(&mut self, command: &str) -> Result<RunOutcome> {
        let mut child = self
            .command(command)
            .spawn()
            .with_context(|| format!("Failed to spawn test command: {}", command))?;

        let mut group = GroupGuard { pgid: child.id() };
        tracing::debug!(pid = ?group.pgid, "test command started");

        let status = child.wait().await.context("Failed to wait for test command")?;
        group.pgid = None;

        tracing::debug!(%status, "test command finished");
        Ok(RunOutcome {
            success: status.success(),
            code: status.code(),
        })
    }
}

/// Kills the child's whole process group unless the child was reaped normally
struct GroupGuard {
    pgid: Option<u32>,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    tracing::debug!(pgid, "killing test process group");
    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid, "failed to kill test process group: {}", e),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {
    // kill_on_drop takes care of the direct child
}
