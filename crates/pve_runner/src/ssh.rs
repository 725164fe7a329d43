//! Process-based runners: `ssh` to a Proxmox host, or a local shell.
//!
//! Scripts are never put on the command line. The interpreter is started on
//! the target and the script is written to its stdin, which keeps quoting out
//! of the picture.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{RunnerError, RunnerResult};
use crate::runner::{CommandRunner, ExecutionResult, RunRequest};

/// Connection settings for [`SshRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    /// Extra `ssh` arguments, e.g. `-o BatchMode=yes`.
    pub extra_args: Vec<String>,
}

impl SshOptions {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            user: "root".to_string(),
            extra_args: vec!["-o".to_string(), "BatchMode=yes".to_string()],
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }
}

/// Runs scripts on a Proxmox host over `ssh`.
pub struct SshRunner {
    options: SshOptions,
}

impl SshRunner {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    /// Arguments passed to the `ssh` binary for `request`.
    pub fn ssh_args(&self, request: &RunRequest) -> Vec<String> {
        let mut args = self.options.extra_args.clone();
        if let Some(port) = self.options.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(format!("{}@{}", self.options.user, self.options.host));
        args.extend(request.remote_command());
        args
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, request: &RunRequest) -> RunnerResult<ExecutionResult> {
        let args = self.ssh_args(request);
        debug!("Executing: ssh {}", args.join(" "));
        execute("ssh", &args, &request.script).await
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.options.user, self.options.host)
    }
}

/// Runs scripts with a local interpreter.
///
/// Container targets still go through `pct exec`, so this also works when
/// the tool runs directly on the Proxmox host.
#[derive(Debug, Default)]
pub struct LocalRunner;

impl LocalRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, request: &RunRequest) -> RunnerResult<ExecutionResult> {
        let mut command = request.remote_command();
        let program = command.remove(0);
        debug!("Executing locally: {} {}", program, command.join(" "));
        execute(&program, &command, &request.script).await
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}

/// Spawn `program`, feed `script` on stdin and collect the outcome.
async fn execute(program: &str, args: &[String], script: &str) -> RunnerResult<ExecutionResult> {
    let started_at = Utc::now();
    let start = Instant::now();

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| RunnerError::SpawnFailed {
            program: program.to_string(),
            message: e.to_string(),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(script.as_bytes()).await?;
        stdin.shutdown().await?;
    }

    let output = child.wait_with_output().await?;
    Ok(ExecutionResult {
        exit_code: output.status.code().unwrap_or(-1) as i64,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        started_at,
        finished_at: Utc::now(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}
