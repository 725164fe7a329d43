//! # pve_runner
//!
//! Command execution engine for pve-deployer.
//!
//! Takes the resolved command list produced by `pve_templates` and runs it,
//! one command at a time, on a Proxmox host or inside one of its containers.
//!
//! # Features
//!
//! - **Runners**: `ssh` to the host, local interpreter, mock for tests
//! - **Outputs**: commands report values as JSON on stdout; later commands
//!   receive them through `{{ token }}` substitution
//! - **Restart**: a checkpoint file after every successful command lets a
//!   failed run resume where it stopped
//!
//! # Example
//!
//! ```rust,no_run
//! use pve_runner::{Executor, RestartInfo, SshOptions, SshRunner};
//! use pve_templates::{Catalog, LoadRequest, Task, TemplateProcessor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = Catalog::open("local", "json")?;
//!     let loaded = TemplateProcessor::new(&catalog)
//!         .load_application(&LoadRequest::new("nginx", Task::Installation))?;
//!
//!     let runner = SshRunner::new(SshOptions::new("pve1"));
//!     let mut info = RestartInfo::new(&loaded.application_id, loaded.task.as_str());
//!     let report = Executor::new(&runner)
//!         .with_params(loaded.resolved_params.clone())
//!         .with_checkpoint("restart.json")
//!         .run(&loaded.commands, &mut info)
//!         .await?;
//!     println!("Success: {}", report.success());
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod error;
pub mod executor;
pub mod mock;
pub mod outputs;
pub mod runner;
pub mod ssh;

pub use checkpoint::RestartInfo;
pub use error::{RunnerError, RunnerResult};
pub use executor::{CommandReport, ExecutionReport, Executor, FailedCommand, RunnerEnumValues};
pub use mock::{MockResponse, MockRunner};
pub use outputs::{parse_outputs, OutputValue};
pub use runner::{CommandRunner, ExecutionResult, RunRequest, RunTarget};
pub use ssh::{LocalRunner, SshOptions, SshRunner};
