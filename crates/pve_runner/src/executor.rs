//! Sequential execution of resolved commands.
//!
//! Commands run strictly in order because later ones consume what earlier
//! ones print. Progress is checkpointed after every successful command.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, error, info};

use pve_templates::{model::value_text, EnumValuesProvider, ExecuteOn, ResolvedCommand, VariableResolver};

use crate::checkpoint::RestartInfo;
use crate::error::{RunnerError, RunnerResult};
use crate::outputs::parse_outputs;
use crate::runner::{CommandRunner, RunRequest, RunTarget};

/// Outcome of one command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub index: usize,
    pub name: String,
    pub exit_code: i64,
    pub duration_ms: u64,
}

/// The command that stopped an execution.
#[derive(Debug, Clone, Serialize)]
pub struct FailedCommand {
    pub index: usize,
    pub name: String,
    pub exit_code: i64,
    pub stderr: String,
}

/// Summary of an [`Executor::run`] call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// Index execution started at; non-zero when resumed.
    pub resumed_from: usize,
    pub executed: Vec<CommandReport>,
    pub outputs: BTreeMap<String, String>,
    pub failed: Option<FailedCommand>,
}

impl ExecutionReport {
    pub fn success(&self) -> bool {
        self.failed.is_none()
    }
}

/// Runs [`ResolvedCommand`]s through a [`CommandRunner`].
pub struct Executor<'a> {
    runner: &'a dyn CommandRunner,
    resolver: VariableResolver,
    /// Values known before execution, used to find `vm_id`.
    params: BTreeMap<String, String>,
    checkpoint_path: Option<PathBuf>,
}

impl<'a> Executor<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            resolver: VariableResolver::new(),
            params: BTreeMap::new(),
            checkpoint_path: None,
        }
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    /// Write the checkpoint to `path` after each successful command.
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    /// Run `commands`, starting after `info.last_successful_index`.
    ///
    /// A command exiting non-zero stops execution and is reported in
    /// [`ExecutionReport::failed`]; transport problems and malformed outputs
    /// are errors.
    pub async fn run(
        &self,
        commands: &[ResolvedCommand],
        info: &mut RestartInfo,
    ) -> RunnerResult<ExecutionReport> {
        let start = info.next_index();
        if start > 0 {
            info!(
                "Resuming {} {} at command {} of {}",
                info.application_id,
                info.task,
                start + 1,
                commands.len()
            );
        }

        let mut report = ExecutionReport {
            resumed_from: start,
            executed: Vec::new(),
            outputs: BTreeMap::new(),
            failed: None,
        };

        for (index, command) in commands.iter().enumerate().skip(start) {
            if command.skipped {
                debug!("Skipping placeholder {}", command.name);
                info.record(index, BTreeMap::new());
                self.save(info)?;
                continue;
            }

            let request = self.request_for(command, &info.outputs)?;
            info!(
                "Executing [{}/{}] {} on {}",
                index + 1,
                commands.len(),
                command.name,
                request.target
            );
            let result = self.runner.run(&request).await?;

            report.executed.push(CommandReport {
                index,
                name: command.name.clone(),
                exit_code: result.exit_code,
                duration_ms: result.duration_ms,
            });

            if !result.success() {
                error!(
                    "Command '{}' failed with exit code {}",
                    command.name, result.exit_code
                );
                report.failed = Some(FailedCommand {
                    index,
                    name: command.name.clone(),
                    exit_code: result.exit_code,
                    stderr: result.stderr,
                });
                break;
            }

            let outputs = collect_outputs(command, &result.stdout)?;
            info.record(index, outputs);
            self.save(info)?;
        }

        report.outputs = info.outputs.clone();
        Ok(report)
    }

    /// Request for `command` with outputs known so far substituted.
    pub fn request_for(
        &self,
        command: &ResolvedCommand,
        outputs: &BTreeMap<String, String>,
    ) -> RunnerResult<RunRequest> {
        let target = match command.execute_on {
            ExecuteOn::Ve => RunTarget::Host,
            ExecuteOn::Lxc => {
                let vm_id = outputs
                    .get("vm_id")
                    .or_else(|| self.params.get("vm_id"))
                    .filter(|v| !pve_templates::is_absent(v))
                    .ok_or_else(|| RunnerError::MissingVmId(command.name.clone()))?;
                RunTarget::Container { vm_id: vm_id.clone() }
            }
        };
        let script = self.resolver.substitute_known(&command.script, outputs);
        Ok(RunRequest::new(command.name.clone(), target, script).interpreter(command.interpreter.clone()))
    }

    fn save(&self, info: &RestartInfo) -> RunnerResult<()> {
        match &self.checkpoint_path {
            Some(path) => info.save(path),
            None => Ok(()),
        }
    }
}

/// Parse stdout and fill declared defaults for outputs that were not printed.
fn collect_outputs(command: &ResolvedCommand, stdout: &str) -> RunnerResult<BTreeMap<String, String>> {
    if command.outputs.is_empty() {
        return Ok(BTreeMap::new());
    }
    let mut outputs = parse_outputs(&command.name, stdout)?;
    for declared in &command.outputs {
        if outputs.contains_key(&declared.id) {
            continue;
        }
        if let Some(default) = declared.default.as_ref().and_then(value_text) {
            outputs.insert(declared.id.clone(), default);
        }
    }
    Ok(outputs)
}

/// [`EnumValuesProvider`] that runs the lookup command through a runner.
///
/// Resolution is synchronous, so this blocks on the runtime it was created
/// in. It must be used from a multi-threaded tokio runtime.
pub struct RunnerEnumValues<'a> {
    executor: Executor<'a>,
    handle: Handle,
}

impl<'a> RunnerEnumValues<'a> {
    pub fn new(executor: Executor<'a>, handle: Handle) -> Self {
        Self { executor, handle }
    }
}

impl EnumValuesProvider for RunnerEnumValues<'_> {
    fn enum_values(&self, command: &ResolvedCommand) -> Result<String, String> {
        let request = self
            .executor
            .request_for(command, &BTreeMap::new())
            .map_err(|e| e.to_string())?;
        let result = tokio::task::block_in_place(|| self.handle.block_on(self.executor.runner.run(&request)))
            .map_err(|e| e.to_string())?;
        if result.success() {
            Ok(result.stdout)
        } else {
            Err(format!("exit code {}: {}", result.exit_code, result.stderr.trim()))
        }
    }
}
