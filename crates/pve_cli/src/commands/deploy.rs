//! Deploy command - resolve an application task and run it.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::json;
use tokio::runtime::Handle;
use tracing::{info, warn};

use pve_runner::{
    CommandRunner, Executor, LocalRunner, RestartInfo, RunnerEnumValues, SshOptions, SshRunner,
};
use pve_templates::{LoadRequest, ParameterValue, ProcessMode, Task, TemplateProcessor};

use super::Cli;

/// Entry of the unresolved-parameters listing.
#[derive(Serialize)]
struct ParameterPrompt<'a> {
    name: &'a str,
    value: &'a str,
}

pub async fn execute(cli: Cli) -> Result<()> {
    let (Some(application), Some(task)) = (cli.application.as_deref(), cli.task.as_deref()) else {
        bail!("An application and a task are required");
    };
    let task: Task = task.parse()?;
    let catalog = cli.catalog()?;
    let request = base_request(&cli, application, &task)?;

    let Some(parameters_path) = &cli.parameters else {
        return print_required_parameters(&catalog, request.with_mode(ProcessMode::Describe));
    };
    let inputs = read_parameters(parameters_path)?;
    let request = request.with_inputs(inputs);

    if cli.dry_run {
        let loaded = TemplateProcessor::new(&catalog)
            .load_application(&request.with_mode(ProcessMode::Describe))?;
        println!("{}", serde_json::to_string_pretty(&loaded.commands)?);
        return Ok(());
    }

    let runner = build_runner(&cli)?;
    info!("Deploying {} ({}) via {}", application, task, runner.describe());

    let provider = RunnerEnumValues::new(Executor::new(runner.as_ref()), Handle::current());
    let loaded = TemplateProcessor::new(&catalog)
        .with_enum_provider(&provider)
        .load_application(&request.with_mode(ProcessMode::Execute))?;

    if !loaded.unresolved_parameters.is_empty() {
        let missing: Vec<&str> = loaded
            .unresolved_parameters
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        bail!("Required parameters without value: {}", missing.join(", "));
    }

    let (mut restart, checkpoint_path) = match &cli.restart_info {
        Some(path) => {
            let restart = RestartInfo::load(path)
                .with_context(|| format!("Failed to read restart info {}", path.display()))?;
            restart.ensure_matches(&loaded.application_id, task.as_str())?;
            (restart, path.clone())
        }
        None => {
            let restart = RestartInfo::new(&loaded.application_id, task.as_str());
            let path = RestartInfo::default_path(Path::new("."), &loaded.application_id, task.as_str());
            (restart, path)
        }
    };

    let report = Executor::new(runner.as_ref())
        .with_params(loaded.resolved_params.clone())
        .with_checkpoint(&checkpoint_path)
        .run(&loaded.commands, &mut restart)
        .await?;

    if let Some(failed) = &report.failed {
        warn!("Resume with restart info {}", checkpoint_path.display());
        bail!(
            "Command {} '{}' failed with exit code {}: {}",
            failed.index + 1,
            failed.name,
            failed.exit_code,
            failed.stderr.trim()
        );
    }

    info!(
        "Completed {} command(s) for {} ({})",
        report.executed.len(),
        loaded.application_id,
        task
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "success": true,
            "restartKey": restart.restart_key,
        }))?
    );
    Ok(())
}

/// Request shared by the describe, dry-run and execute paths.
fn base_request(cli: &Cli, application: &str, task: &Task) -> Result<LoadRequest> {
    Ok(LoadRequest::new(application, task.clone())
        .with_context(cli.execution_context())
        .with_addons(cli.addons.clone())
        .with_env(cli.env_map()?))
}

fn print_required_parameters(catalog: &pve_templates::Catalog, request: LoadRequest) -> Result<()> {
    let loaded = TemplateProcessor::new(catalog).load_application(&request)?;
    let prompts: Vec<ParameterPrompt> = loaded
        .unresolved_parameters
        .iter()
        .map(|p| ParameterPrompt {
            name: &p.id,
            value: "",
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&prompts)?);
    Ok(())
}

fn read_parameters(path: &Path) -> Result<Vec<ParameterValue>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read parameters file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Parameters file {} is not a [{{name, value}}] array", path.display()))
}

fn build_runner(cli: &Cli) -> Result<Box<dyn CommandRunner>> {
    if cli.local {
        return Ok(Box::new(LocalRunner::new()));
    }
    let Some(host) = &cli.host else {
        bail!("No Proxmox host given (use --host or PVE_HOST, or --local)");
    };
    let mut options = SshOptions::new(host).user(&cli.user);
    if let Some(port) = cli.port {
        options = options.port(port);
    }
    Ok(Box::new(SshRunner::new(options)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_read_parameters() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("params.json");
        fs::write(&path, r#"[{"name": "hostname", "value": "web01"}, {"name": "memory", "value": 512}]"#).unwrap();
        let inputs = read_parameters(&path).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[1].value, 512);

        fs::write(&path, r#"{"hostname": "web01"}"#).unwrap();
        assert!(read_parameters(&path).is_err());
    }

    #[test]
    fn test_request_carries_host_context() {
        use clap::Parser;
        let temp = tempdir().unwrap();
        let json = temp.path().join("json");
        fs::create_dir_all(json.join("applications/web")).unwrap();
        fs::create_dir_all(json.join("shared/templates")).unwrap();
        fs::write(
            json.join("applications/web/application.json"),
            r#"{"name": "Web", "installation": ["whoami"]}"#,
        )
        .unwrap();
        fs::write(
            json.join("shared/templates/whoami.json"),
            r#"{"execute_on": "ve", "name": "Who", "commands": [{"command": "echo {{ ve_context_key }}"}]}"#,
        )
        .unwrap();

        let cli = Cli::parse_from([
            "pve-deploy".to_string(),
            "web".to_string(),
            "installation".to_string(),
            "--host=pve1".to_string(),
            format!("--json-root={}", json.display()),
            format!("--local-root={}", temp.path().join("local").display()),
        ]);
        let catalog = cli.catalog().unwrap();
        let request = base_request(&cli, "web", &Task::Installation)
            .unwrap()
            .with_mode(ProcessMode::Describe);
        let loaded = TemplateProcessor::new(&catalog).load_application(&request).unwrap();
        assert_eq!(loaded.commands[0].script, "echo pve1");
    }

    #[test]
    fn test_runner_requires_host_or_local() {
        use clap::Parser;
        let cli = Cli::parse_from(["pve-deploy", "app", "installation"]);
        assert!(build_runner(&cli).is_err());
        let cli = Cli::parse_from(["pve-deploy", "app", "installation", "--host", "pve1"]);
        assert_eq!(build_runner(&cli).unwrap().describe(), "root@pve1");
    }
}
