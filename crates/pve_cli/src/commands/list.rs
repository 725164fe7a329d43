//! List command - show every application in both layers.

use anyhow::Result;
use tracing::info;

use pve_templates::{ApplicationLoader, ApplicationSummary};

use super::Cli;

pub async fn execute(cli: Cli) -> Result<()> {
    let catalog = cli.catalog()?;
    let applications = ApplicationLoader::new(&catalog).list_applications();
    info!("Found {} application(s)", applications.len());

    if applications.is_empty() {
        println!("No applications found.");
        return Ok(());
    }
    for summary in &applications {
        print!("{}", format_summary(summary, cli.verbose));
    }
    Ok(())
}

fn format_summary(summary: &ApplicationSummary, verbose: bool) -> String {
    let mut out = format!("{:<24} {}", summary.id, summary.name);
    if let Some(parent) = &summary.extends {
        out.push_str(&format!(" (extends {})", parent));
    }
    if !summary.errors.is_empty() {
        out.push_str(&format!(" [{} error(s)]", summary.errors.len()));
    }
    out.push('\n');

    if verbose {
        if let Some(description) = &summary.description {
            out.push_str(&format!("    {}\n", description));
        }
        if !summary.tags.is_empty() {
            out.push_str(&format!("    tags: {}\n", summary.tags.join(", ")));
        }
        for error in &summary.errors {
            out.push_str(&format!("    - {}\n", error));
        }
    }
    out
}
