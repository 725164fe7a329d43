//! # pve_templates
//!
//! Application, template and addon resolution for pve-deployer.
//!
//! This crate turns declarative JSON documents into the ordered, fully
//! substituted command list that deploys an application into a Proxmox LXC
//! container:
//!
//! - Application inheritance through `extends`, with per-phase template merge
//!   (`before` / `after` insertion)
//! - Addons spliced into the task's phases when compatible
//! - Parameter resolution from inputs, defaults with `${VAR:-default}`
//!   expansion, computed values and earlier command outputs
//! - JSON Schema validation with errors pointing at file and line
//!
//! Documents live in two layers: a `local` override root and the shipped
//! `json` root. A [`Catalog`] owns access to both.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pve_templates::{Catalog, LoadRequest, Task, TemplateProcessor};
//!
//! let catalog = Catalog::open("local", "json").unwrap();
//! let request = LoadRequest::new("nginx", Task::Installation)
//!     .with_input("hostname", "web01")
//!     .with_addons(vec!["samba".to_string()]);
//!
//! match TemplateProcessor::new(&catalog).load_application(&request) {
//!     Ok(loaded) => {
//!         for command in &loaded.commands {
//!             println!("{}: {}", command.name, command.script);
//!         }
//!     }
//!     Err(e) => eprint!("{}", e.render()),
//! }
//! ```

pub mod addons;
pub mod application;
pub mod cache;
pub mod catalog;
pub mod error;
pub mod model;
pub mod processor;
pub mod repository;
pub mod schema;
pub mod source;
pub mod variables;

pub use addons::{is_addon_compatible, merge_addon_templates, AddonService};
pub use application::{ApplicationLoader, ApplicationSummary, ResolvedApplication};
pub use cache::DocumentCache;
pub use catalog::{Catalog, LoadedTemplate};
pub use error::{ConfigurationError, ErrorDetail, TemplateError, TemplateResult};
pub use model::{
    interpreter_for, merge_template_refs, Addon, Application, Command, CommandAction, CompatibleWith,
    ExecuteOn, OutputDecl, Parameter, ParameterType, ParameterValue, Phase, PhaseTemplates,
    ResolvedCommand, Task, Template, TemplateRef,
};
pub use processor::{
    EnumValuesProvider, ExecutionContext, LoadRequest, LoadedApplication, ProcessMode,
    TemplateProcessor, MAX_TEMPLATE_DEPTH,
};
pub use repository::{ApplicationId, Layer, Repository};
pub use schema::{DocumentValidator, SchemaKind, SchemaValidator};
pub use source::{JsonDocument, SourceMap};
pub use variables::{is_absent, EnvMap, LayeredLookup, ValueLookup, VariableResolver, NOT_DEFINED};
