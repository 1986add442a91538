use std::{path::Path, process::Stdio, time::SystemTime};

use nix::unistd::{Pid, setsid};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::info;

use crate::fs::{self, FsError};

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("nothing to launch")]
    Empty,

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("failed to write launch log {path}")]
    Log {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited before reporting a pid")]
    NoPid { command: String },
}

/// Starts `argv` as a session leader that outlives this process.
///
/// Stdin is closed and stdout/stderr are appended to `log_file`, after a timestamped
/// line recording the command. Returns as soon as the child has a pid.
pub async fn spawn_detached(
    argv: &[String],
    log_file: &Path,
    cwd: &Path,
) -> Result<Pid, LaunchError> {
    let (program, args) = argv.split_first().ok_or(LaunchError::Empty)?;
    let command = argv.join(" ");

    let mut log = fs::append_file(log_file).await?;
    let line = format!(
        "{} Run command: {command}\n",
        humantime::format_rfc3339_seconds(SystemTime::now())
    );
    log.write_all(line.as_bytes())
        .await
        .map_err(|source| LaunchError::Log {
            path: log_file.to_path_buf(),
            source,
        })?;
    let stdout = log.into_std().await;
    let stderr = stdout.try_clone().map_err(|source| LaunchError::Log {
        path: log_file.to_path_buf(),
        source,
    })?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| setsid().map(|_| ()).map_err(std::io::Error::from));
    }

    let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        command: command.clone(),
        source,
    })?;
    let pid = child.id().ok_or(LaunchError::NoPid { command })?;
    info!(pid, "launched detached process");
    Ok(Pid::from_raw(pid as i32))
}
