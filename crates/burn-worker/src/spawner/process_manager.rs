//! Process Manager Module
//!
//! Handles the lifecycle of one child process: spawn with a piped stdout,
//! polite termination with SIGTERM, and reaping.

use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::process::{Child, ChildStdout, Command};
use tracing::debug;

/// Manages a single child process
#[derive(Debug)]
pub struct ProcessManager {
    label: String,
    child: Child,
    status: Option<ExitStatus>,
}

impl ProcessManager {
    /// Spawn `command` with stdout piped back to the supervisor.
    ///
    /// Children are killed if the manager is dropped without being reaped.
    pub fn spawn(label: &str, mut command: Command) -> Result<(Self, ChildStdout)> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", label))?;

        let stdout = child
            .stdout
            .take()
            .with_context(|| format!("{} has no stdout pipe", label))?;

        debug!(process = label, pid = child.id(), "Spawned");

        Ok((
            Self {
                label: label.to_string(),
                child,
                status: None,
            },
            stdout,
        ))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns Some(ExitStatus) if the process has exited, None otherwise
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if self.status.is_none() {
            self.status = self.child.try_wait()?;
        }
        Ok(self.status)
    }

    /// Ask the process to exit. A process that already exited is left alone.
    pub fn terminate(&mut self) -> Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        send_sigterm(pid).with_context(|| format!("Failed to signal {}", self.label))
    }

    /// Reap the process
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self
            .child
            .wait()
            .await
            .with_context(|| format!("Failed to reap {}", self.label))?;
        self.status = Some(status);
        Ok(status)
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).context("pid out of range")?;
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> Result<()> {
    anyhow::bail!("SIGTERM is only available on unix")
}
