//! pve-deploy - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: Execution failed
//! - 2: Configuration error

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pve_templates::ConfigurationError;

mod commands;

use commands::Cli;

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const CONFIGURATION_ERROR: u8 = 2;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the JSON results.
    let level = if cli.verbose { "pve=debug" } else { "pve=info" };
    let mut filter = EnvFilter::from_default_env();
    for directive in [level, "warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();

    let result = if cli.list {
        commands::list::execute(cli).await
    } else {
        commands::deploy::execute(cli).await
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => match e.downcast_ref::<ConfigurationError>() {
            Some(config) => {
                eprint!("{}", config.render());
                ExitCode::from(ExitCodes::CONFIGURATION_ERROR)
            }
            None => {
                eprintln!("Error: {:#}", e);
                ExitCode::from(ExitCodes::GENERAL_ERROR)
            }
        },
    }
}
