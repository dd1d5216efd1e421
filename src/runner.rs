//! Subprocess capability for the ICMP and trace engines.
//!
//! Raw sockets need root; the `ping`/`traceroute` binaries carry
//! `CAP_NET_RAW` in the deployment image instead, so the engines shell out.
//! Parsers stay free of I/O by talking to this trait, which tests replace
//! with a scripted fake.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: impl IntoIterator<Item = String>) -> Self {
        CommandSpec {
            program: program.to_string(),
            args: args.into_iter().collect(),
        }
    }

    pub fn display(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// Combined stdout+stderr; ping implementations disagree about which
    /// stream carries the summary.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("{0}: command not found")]
    NotFound(String),
    #[error("failed to run {0}: {1}")]
    Io(String, String),
    #[error("{0} did not finish within {1:?}")]
    TimedOut(String, Duration),
    #[error("command cancelled")]
    Cancelled,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion, capturing both output streams. The
    /// child process is killed on timeout or cancellation.
    async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RunError>;
}

pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RunError> {
        debug!(command = %spec.display(), "running subprocess");

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the future (deadline, caller hangup) must not orphan
            // a raw-socket child.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => RunError::NotFound(spec.program.clone()),
                _ => RunError::Io(spec.program.clone(), e.to_string()),
            })?;

        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let output = tokio::select! {
            out = &mut wait => out.map_err(|e| RunError::Io(spec.program.clone(), e.to_string()))?,
            _ = cancel.cancelled() => return Err(RunError::Cancelled),
            _ = tokio::time::sleep(timeout) => {
                return Err(RunError::TimedOut(spec.program.clone(), timeout));
            }
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}
