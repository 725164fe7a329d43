//! CLI argument definitions.
//!
//! `pve-deploy` takes the application and task positionally, followed by
//! the optional parameters and restart-info files. Every option can also be
//! set through a `PVE_*` environment variable.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;

use pve_templates::{Catalog, EnvMap, ExecutionContext};

pub mod deploy;
pub mod list;

/// pve-deploy - deploy applications into Proxmox LXC containers
#[derive(Parser, Debug)]
#[command(name = "pve-deploy")]
#[command(version, about = "Deploy applications into Proxmox LXC containers")]
#[command(long_about = r#"
Resolves an application's templates for a task and runs the resulting
commands on a Proxmox VE host.

Without a parameters file the required parameters are printed as JSON,
ready to be filled in and passed back.

EXIT CODES:
  0 - Success
  1 - Execution failed
  2 - Configuration or usage error
"#)]
pub struct Cli {
    /// Application id (`name` or `json:name`)
    #[arg(required_unless_present = "list")]
    pub application: Option<String>,

    /// Task to run (installation, upgrade, backup, ...)
    #[arg(required_unless_present = "list")]
    pub task: Option<String>,

    /// JSON file with `[{ "name": ..., "value": ... }]` inputs
    pub parameters: Option<PathBuf>,

    /// Restart info from a failed run to resume
    pub restart_info: Option<PathBuf>,

    /// Root of the site-local override layer
    #[arg(long, env = "PVE_LOCAL_ROOT", default_value = "local")]
    pub local_root: PathBuf,

    /// Root of the shipped application layer
    #[arg(long, env = "PVE_JSON_ROOT", default_value = "json")]
    pub json_root: PathBuf,

    /// Proxmox VE host to run commands on
    #[arg(long, env = "PVE_HOST")]
    pub host: Option<String>,

    /// SSH port of the host
    #[arg(long, env = "PVE_PORT")]
    pub port: Option<u16>,

    /// SSH user
    #[arg(long, env = "PVE_USER", default_value = "root")]
    pub user: String,

    /// `.env` file used for `${VAR:-default}` expansion
    #[arg(long, env = "PVE_ENV_FILE")]
    pub env_file: Option<PathBuf>,

    /// docker-compose file whose defaults feed `${VAR:-default}` expansion
    #[arg(long, env = "PVE_COMPOSE_FILE")]
    pub compose_file: Option<PathBuf>,

    /// Addon to apply (repeatable)
    #[arg(long = "addon", env = "PVE_ADDONS", value_delimiter = ',')]
    pub addons: Vec<String>,

    /// Run commands on this machine instead of over ssh
    #[arg(long, env = "PVE_LOCAL")]
    pub local: bool,

    /// Print the resolved commands instead of running them
    #[arg(long, env = "PVE_DRY_RUN")]
    pub dry_run: bool,

    /// List applications and exit
    #[arg(long)]
    pub list: bool,

    /// Enable verbose output
    #[arg(short, long, env = "PVE_VERBOSE")]
    pub verbose: bool,
}

impl Cli {
    pub fn catalog(&self) -> Result<Catalog> {
        debug!(
            "Opening repository local={:?} json={:?}",
            self.local_root, self.json_root
        );
        Catalog::open(&self.local_root, &self.json_root).context("Failed to load bundled schemas")
    }

    /// Host key templates see as `ve_context_key`.
    pub fn execution_context(&self) -> ExecutionContext {
        match (&self.host, self.local) {
            (_, true) => ExecutionContext::new("local"),
            (Some(host), false) => ExecutionContext::new(host),
            (None, false) => ExecutionContext::default(),
        }
    }

    /// Compose defaults overridden by the `.env` file.
    pub fn env_map(&self) -> Result<EnvMap> {
        let mut env = EnvMap::new();
        if let Some(path) = &self.compose_file {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read compose file {}", path.display()))?;
            env = env.merged(
                EnvMap::from_compose(&text)
                    .with_context(|| format!("Failed to parse compose file {}", path.display()))?,
            );
        }
        if let Some(path) = &self.env_file {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read env file {}", path.display()))?;
            env = env.merged(EnvMap::from_env_file(&text));
        }
        Ok(env)
    }
}
