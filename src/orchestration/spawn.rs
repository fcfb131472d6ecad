//! Background processes that outlive the launching CLI.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Receives both stdout and stderr, appended.
    pub log_file: PathBuf,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl SpawnRequest {
    /// Display form of the command line, for logs and errors.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Starts a process detached from the caller and returns its pid.
pub trait Spawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<u32>;
}

/// Spawns into a new process group so terminal signals sent to the
/// launcher do not reach the agent.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedSpawner;

impl Spawner for DetachedSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<u32> {
        if let Some(parent) = request.log_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.log_file)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .current_dir(&request.working_dir)
            .envs(request.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|e| {
            warn!(command = %request.command_line(), error = %e, "detached spawn failed");
            Error::TaskLaunch {
                task: request.program.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        let pid = child.id();
        debug!(pid, log = %request.log_file.display(), "detached process started");
        // Not waited on: the child belongs to no one once the launcher exits.
        drop(child);
        Ok(pid)
    }
}
