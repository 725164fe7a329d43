//! Command runner trait and types.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RunnerResult;

/// Where a script runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RunTarget {
    /// The Proxmox VE host itself.
    Host,
    /// Inside an LXC container, through `pct exec`.
    Container { vm_id: String },
}

impl fmt::Display for RunTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Container { vm_id } => write!(f, "container {}", vm_id),
        }
    }
}

/// One script to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Display name, used in logs and errors.
    pub name: String,
    pub target: RunTarget,
    /// Program the script is fed to on stdin.
    pub interpreter: String,
    pub script: String,
}

impl RunRequest {
    pub fn new(name: impl Into<String>, target: RunTarget, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target,
            interpreter: "sh".to_string(),
            script: script.into(),
        }
    }

    pub fn interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Program and arguments that run the interpreter on the target.
    ///
    /// Container targets are wrapped in `pct exec <vm_id> --`.
    pub fn remote_command(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let RunTarget::Container { vm_id } = &self.target {
            args.extend(["pct".to_string(), "exec".to_string(), vm_id.clone(), "--".to_string()]);
        }
        args.push(self.interpreter.clone());
        args
    }
}

/// Result of one script execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exit code of the interpreter
    pub exit_code: i64,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Execution start time
    pub started_at: DateTime<Utc>,
    /// Execution end time
    pub finished_at: DateTime<Utc>,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Check if execution was successful (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes scripts on a Proxmox host or in one of its containers.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run one script and capture its output. A non-zero exit code is a
    /// successful call with a failing result.
    async fn run(&self, request: &RunRequest) -> RunnerResult<ExecutionResult>;

    /// Short description of where commands go, for logs.
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_command_wraps_container_target() {
        let host = RunRequest::new("a", RunTarget::Host, "true");
        assert_eq!(host.remote_command(), vec!["sh"]);

        let lxc = RunRequest::new("b", RunTarget::Container { vm_id: "105".into() }, "print(1)")
            .interpreter("python3");
        assert_eq!(lxc.remote_command(), vec!["pct", "exec", "105", "--", "python3"]);
        assert_eq!(lxc.target.to_string(), "container 105");
    }
}
