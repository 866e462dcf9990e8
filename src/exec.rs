//! External Command Execution
//!
//! Every call into the host's networking tools goes through here so that
//! each one carries its own deadline. A hung `ip` or `iptables` can delay
//! one iteration, never wedge the loop.

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Command failure
#[derive(Debug, Error)]
pub enum CommandError {
    /// The program could not be started
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program name
        program: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },
    /// The deadline passed and the child was killed
    #[error("{program} timed out after {timeout:?}")]
    Timeout {
        /// Program name
        program: String,
        /// Deadline that expired
        timeout: Duration,
    },
    /// Non-zero exit or death by signal
    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        /// Full command line
        command: String,
        /// Exit status as printed
        status: String,
        /// Captured standard error
        stderr: String,
    },
}

/// Captured output of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit status was zero
    pub success: bool,
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

/// Runs host commands with a hard deadline
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    /// Runner applying `timeout` to every command
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Default deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run and capture output, whatever the exit status
    pub async fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        self.output_within(program, args, self.timeout).await
    }

    /// Run with an explicit deadline
    pub async fn output_within(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        tracing::trace!("exec: {} {}", program, args.join(" "));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        // Dropping the future on timeout kills the child.
        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(CommandError::Spawn {
                    program: program.to_string(),
                    source: e,
                })
            }
            Err(_) => {
                return Err(CommandError::Timeout {
                    program: program.to_string(),
                    timeout,
                })
            }
        };

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run and require a zero exit status; returns trimmed stdout
    pub async fn run(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
        let output = self.output(program, args).await?;
        if !output.success {
            return Err(CommandError::Failed {
                command: format!("{} {}", program, args.join(" ")),
                status: output
                    .code
                    .map(|c| format!("status {}", c))
                    .unwrap_or_else(|| "signal".into()),
                stderr: output.stderr,
            });
        }
        Ok(output.stdout.trim().to_string())
    }
}
