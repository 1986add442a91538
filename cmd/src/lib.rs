use std::ffi::OsStr;
use std::fmt::Display;
use std::path::Path;
use std::process::{Output, Stdio};

use thiserror::Error;
use tokio::process::Command as BaseCommand;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn command: {command}")]
    Spawn {
        command: String,
        #[source]
        error: tokio::io::Error,
    },

    #[error("command failed ({status}): {command}\n{stderr}")]
    Failure {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// External tool invocation with captured output and a printable command line.
#[derive(Debug)]
pub struct Command {
    cmd: BaseCommand,
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cmd = self.cmd.as_std();
        write!(f, "{}", cmd.get_program().to_string_lossy())?;
        for arg in cmd.get_args() {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

impl Command {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            cmd: BaseCommand::new(program),
        }
    }

    /// Run a shell script file with `bash`, passing extra arguments after it.
    pub fn bash<P: AsRef<Path>>(script: P) -> Self {
        let mut cmd = Self::new("bash");
        cmd.arg(script.as_ref());
        cmd
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.cmd.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.cmd.args(args);
        self
    }

    pub fn current_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self {
        self.cmd.current_dir(dir);
        self
    }

    /// Wait for the command with stdout and stderr captured, whatever its exit status.
    pub async fn output(&mut self) -> Result<Output, CommandError> {
        debug!(command = %self, "run command");
        self.cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|error| CommandError::Spawn {
                command: self.to_string(),
                error,
            })
    }

    pub async fn run(&mut self) -> Result<Output, CommandError> {
        let output = self.output().await?;
        if !output.status.success() {
            return Err(CommandError::Failure {
                command: self.to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_owned(),
            });
        }
        Ok(output)
    }

    /// Run and return stdout as a string, failing on a non-zero exit.
    pub async fn run_to_string(&mut self) -> Result<String, CommandError> {
        let output = self.run().await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
