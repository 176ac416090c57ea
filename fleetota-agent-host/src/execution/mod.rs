//! Command execution for the update pipeline
//!
//! Handles:
//! - Running system tools (systemctl, tar, dpkg, modprobe...) with a timeout
//! - Optional `sudo` elevation
//! - Captured stdout/stderr for step error messages
//!
//! Commands are always program + argument vector, never a shell string.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

/// Command execution result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Short reason for a failed command, for error messages
    pub fn failure_reason(&self) -> String {
        let stderr = self.stderr.trim();
        let detail = if stderr.is_empty() { self.stdout.trim() } else { stderr };
        match self.exit_code {
            Some(code) if detail.is_empty() => format!("exit code {code}"),
            Some(code) => format!("exit code {code}: {detail}"),
            None if detail.is_empty() => "terminated by signal".to_string(),
            None => format!("terminated by signal: {detail}"),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, ExecutionError>;
}

/// Runs commands on the host through `tokio::process`
pub struct SystemCommandRunner {
    use_sudo: bool,
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(use_sudo: bool, timeout: Duration) -> Self {
        Self { use_sudo, timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, ExecutionError> {
        let start_time = Instant::now();

        let mut command = if self.use_sudo {
            let mut c = AsyncCommand::new("sudo");
            c.arg("-n").arg(program);
            c
        } else {
            AsyncCommand::new(program)
        };
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| ExecutionError::Timeout { program: program.to_string(), timeout: self.timeout })?
            .map_err(|source| ExecutionError::Spawn { program: program.to_string(), source })?;

        debug!(
            program,
            ?args,
            exit_code = ?output.status.code(),
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "command finished"
        );

        Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
