//! Template processor.
//!
//! Turns an application, a task and the caller's inputs into the ordered list
//! of fully substituted commands the execution engine runs.
//!
//! Processing happens in two passes over the merged template list:
//! 1. every template is loaded, its parameters declared and its commands
//!    planned (includes inlined, `skip_if_all_missing` applied);
//! 2. each planned command is rendered: scripts are read, every `{{ token }}`
//!    is checked against what is declared and then substituted.
//!
//! All problems from both passes end up in a single [`ConfigurationError`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::addons::{is_addon_compatible, merge_addon_templates, AddonService};
use crate::application::{ApplicationLoader, ResolvedApplication};
use crate::catalog::{Catalog, LoadedTemplate};
use crate::error::{ConfigurationError, ErrorDetail, TemplateError};
use crate::model::{
    interpreter_for, value_text, Command, CommandAction, ExecuteOn, Parameter, ParameterValue, Phase,
    PhaseTemplates, ResolvedCommand, Task, Template,
};
use crate::repository::ApplicationId;
use crate::source::JsonDocument;
use crate::variables::{is_absent, EnvMap, LayeredLookup, ValueLookup, VariableResolver, NOT_DEFINED};

/// Deepest chain of `{ "template": ... }` includes allowed.
pub const MAX_TEMPLATE_DEPTH: usize = 10;

/// Values the processor derives itself. Always declared.
pub const COMPUTED_DEFAULTS: [&str; 5] = [
    "application_id",
    "application_name",
    "task",
    "ve_context_key",
    "selected_addons",
];

/// What the result is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessMode {
    /// Commands will run; `enumValuesTemplate` lookups are executed.
    #[default]
    Execute,
    /// Only describe parameters and commands.
    Describe,
}

/// Where the resolved commands will run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Key identifying the Proxmox host connection.
    pub ve_context_key: Option<String>,
}

impl ExecutionContext {
    pub fn new(ve_context_key: impl Into<String>) -> Self {
        Self {
            ve_context_key: Some(ve_context_key.into()),
        }
    }
}

/// Input to [`TemplateProcessor::load_application`].
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub application_id: String,
    pub task: Task,
    pub context: ExecutionContext,
    pub mode: ProcessMode,
    pub inputs: Vec<ParameterValue>,
    pub selected_addons: Vec<String>,
    pub env: EnvMap,
}

impl LoadRequest {
    pub fn new(application_id: impl Into<String>, task: Task) -> Self {
        Self {
            application_id: application_id.into(),
            task,
            context: ExecutionContext::default(),
            mode: ProcessMode::default(),
            inputs: Vec::new(),
            selected_addons: Vec::new(),
            env: EnvMap::default(),
        }
    }

    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_mode(mut self, mode: ProcessMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<ParameterValue>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.push(ParameterValue::new(name, value));
        self
    }

    pub fn with_addons(mut self, addons: Vec<String>) -> Self {
        self.selected_addons = addons;
        self
    }

    pub fn with_env(mut self, env: EnvMap) -> Self {
        self.env = env;
        self
    }
}

/// Result of processing one application and task.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedApplication {
    pub application_id: String,
    pub task: Task,
    /// Every declared parameter, first declaration of an id winning.
    pub parameters: Vec<Parameter>,
    pub commands: Vec<ResolvedCommand>,
    /// Parameter values known at resolution time.
    pub resolved_params: BTreeMap<String, String>,
    /// Required parameters nobody supplied a value for.
    pub unresolved_parameters: Vec<Parameter>,
    pub hierarchy: Vec<ApplicationId>,
    /// Addons that were actually applied.
    pub selected_addons: Vec<String>,
}

/// Runs the first command of an `enumValuesTemplate` and returns its stdout.
#[cfg_attr(test, mockall::automock)]
pub trait EnumValuesProvider {
    fn enum_values(&self, command: &ResolvedCommand) -> Result<String, String>;
}

/// A command planned in the first pass.
enum Step {
    Skipped {
        template: String,
        phase: Phase,
        execute_on: ExecuteOn,
        outputs: Vec<String>,
    },
    Command {
        template: String,
        phase: Phase,
        execute_on: ExecuteOn,
        document: Arc<JsonDocument>,
        pointer: String,
        command: Command,
    },
}

/// State of one processing run.
struct Resolution {
    application_id: String,
    hierarchy: Vec<ApplicationId>,
    inputs: HashMap<String, String>,
    defaults: HashMap<String, String>,
    /// Addon properties; they behave like outputs known up front.
    outputs: HashMap<String, String>,
    /// Outputs declared by commands emitted so far.
    declared_outputs: HashSet<String>,
    parameters: Vec<Parameter>,
    steps: Vec<Step>,
    errors: Vec<ErrorDetail>,
}

impl Resolution {
    fn lookup(&self) -> LayeredLookup<'_> {
        LayeredLookup {
            inputs: &self.inputs,
            defaults: &self.defaults,
            outputs: &self.outputs,
        }
    }

    fn is_parameter(&self, id: &str) -> bool {
        self.parameters.iter().any(|p| p.id == id)
    }

    fn is_declared(&self, name: &str) -> bool {
        self.is_parameter(name)
            || COMPUTED_DEFAULTS.contains(&name)
            || self.outputs.contains_key(name)
            || self.declared_outputs.contains(name)
    }

    fn declare(
        &mut self,
        parameters: &[Parameter],
        template_name: Option<&str>,
        resolver: &VariableResolver,
        env: &EnvMap,
    ) {
        for parameter in parameters {
            if self.is_parameter(&parameter.id) {
                continue;
            }
            let mut parameter = parameter.clone();
            if parameter.name.is_empty() {
                parameter.name = parameter.id.clone();
            }
            if let Some(name) = template_name {
                parameter.templatename = Some(name.to_string());
            }
            if let Some(text) = parameter.default_text() {
                let expanded = resolver.expand_shell_defaults(&text, env);
                if expanded != text {
                    parameter.default = Some(Value::String(expanded.clone()));
                }
                if !is_absent(&expanded) {
                    self.defaults.entry(parameter.id.clone()).or_insert(expanded);
                }
            }
            self.parameters.push(parameter);
        }
    }
}

/// Builds [`LoadedApplication`]s from a [`Catalog`].
pub struct TemplateProcessor<'a> {
    catalog: &'a Catalog,
    resolver: VariableResolver,
    enum_provider: Option<&'a dyn EnumValuesProvider>,
}

impl<'a> TemplateProcessor<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            resolver: VariableResolver::new(),
            enum_provider: None,
        }
    }

    pub fn with_enum_provider(mut self, provider: &'a dyn EnumValuesProvider) -> Self {
        self.enum_provider = Some(provider);
        self
    }

    /// Resolve `request` into an ordered command list.
    pub fn load_application(&self, request: &LoadRequest) -> Result<LoadedApplication, ConfigurationError> {
        let resolved = ApplicationLoader::new(self.catalog)
            .read_application(&request.application_id, &request.task)?;

        let mut state = Resolution {
            application_id: resolved.application.id.clone(),
            hierarchy: resolved.hierarchy.clone(),
            inputs: request
                .inputs
                .iter()
                .filter_map(|input| Some((input.name.clone(), value_text(&input.value)?)))
                .filter(|(_, value)| !is_absent(value))
                .collect(),
            defaults: HashMap::new(),
            outputs: HashMap::new(),
            declared_outputs: HashSet::new(),
            parameters: Vec::new(),
            steps: Vec::new(),
            errors: Vec::new(),
        };

        self.insert_computed_defaults(&mut state, &resolved, request);
        state.declare(&resolved.parameters, None, &self.resolver, &request.env);

        let (task_templates, applied_addons) = self.apply_addons(&mut state, &resolved, request);
        state.defaults.insert("selected_addons".to_string(), applied_addons.join(","));

        for phase in Phase::ALL {
            for entry in task_templates.get(phase) {
                match self.catalog.load_template(entry.name(), &state.hierarchy) {
                    Ok(loaded) => self.plan_template(&mut state, &loaded, phase, 1, &request.env),
                    Err(details) => state.errors.push(
                        ErrorDetail::new(format!(
                            "Template {} of application {} could not be loaded",
                            entry.name(),
                            state.application_id
                        ))
                        .with_details(details),
                    ),
                }
            }
        }

        match request.mode {
            ProcessMode::Execute => self.resolve_enum_values(&mut state),
            ProcessMode::Describe => self.check_enum_templates(&mut state),
        }

        let commands = self.render_steps(&mut state);

        let lookup = state.lookup();
        let resolved_params: BTreeMap<String, String> = state
            .parameters
            .iter()
            .filter_map(|p| Some((p.id.clone(), lookup.lookup(&p.id)?)))
            .collect();
        let unresolved_parameters: Vec<Parameter> = state
            .parameters
            .iter()
            .filter(|p| p.required && !resolved_params.contains_key(&p.id))
            .cloned()
            .collect();

        if !state.errors.is_empty() {
            let mut summary = resolved.summary();
            summary.errors = state.errors.clone();
            return Err(ConfigurationError::new(
                format!(
                    "Application {} has {} configuration error(s)",
                    state.application_id,
                    state.errors.len()
                ),
                state.errors,
            )
            .with_application(summary));
        }

        info!(
            "Loaded {} for task {}: {} command(s), {} unresolved parameter(s)",
            state.application_id,
            request.task,
            commands.len(),
            unresolved_parameters.len()
        );

        Ok(LoadedApplication {
            application_id: state.application_id,
            task: request.task.clone(),
            parameters: state.parameters,
            commands,
            resolved_params,
            unresolved_parameters,
            hierarchy: state.hierarchy,
            selected_addons: applied_addons,
        })
    }

    fn insert_computed_defaults(
        &self,
        state: &mut Resolution,
        resolved: &ResolvedApplication,
        request: &LoadRequest,
    ) {
        state
            .defaults
            .insert("application_id".to_string(), resolved.application.id.clone());
        state
            .defaults
            .insert("application_name".to_string(), resolved.application.name.clone());
        state
            .defaults
            .insert("task".to_string(), request.task.to_string());
        if let Some(key) = &request.context.ve_context_key {
            state.defaults.insert("ve_context_key".to_string(), key.clone());
        }
    }

    /// Splice selected, compatible addons into the task templates.
    fn apply_addons(
        &self,
        state: &mut Resolution,
        resolved: &ResolvedApplication,
        request: &LoadRequest,
    ) -> (PhaseTemplates, Vec<String>) {
        let service = AddonService::new(self.catalog);
        let mut templates = resolved.task_templates.clone();
        let mut applied = Vec::new();

        for id in &request.selected_addons {
            let addon = match service.load_addon(id) {
                Ok(Some(addon)) => addon,
                Ok(None) => continue,
                Err(TemplateError::Invalid(detail)) => {
                    state.errors.push(detail);
                    continue;
                }
                Err(e) => {
                    state
                        .errors
                        .push(ErrorDetail::new(format!("Addon {} could not be loaded: {}", id, e)));
                    continue;
                }
            };
            if !is_addon_compatible(&addon, &resolved.application) {
                warn!(
                    "Addon {} is not compatible with application {}, skipping",
                    id, resolved.application.id
                );
                continue;
            }

            for &phase in request.task.addon_phases() {
                let merged = merge_addon_templates(templates.get(phase), &addon, phase);
                templates = templates.with_phase(phase, merged);
            }
            match service.extract_addon_parameters(&addon, &state.hierarchy) {
                Ok(parameters) => state.declare(&parameters, None, &self.resolver, &request.env),
                Err(details) => state.errors.push(
                    ErrorDetail::new(format!("Parameters of addon {} could not be read", id))
                        .with_details(details),
                ),
            }
            for property in &addon.properties {
                if let Some(value) = value_text(&property.value) {
                    state.outputs.insert(property.id.clone(), value);
                }
            }
            debug!("Applied addon {} to {}", id, resolved.application.id);
            applied.push(id.clone());
        }
        (templates, applied)
    }

    /// First pass: declare parameters and queue commands.
    fn plan_template(
        &self,
        state: &mut Resolution,
        loaded: &LoadedTemplate,
        phase: Phase,
        depth: usize,
        env: &EnvMap,
    ) {
        let template = &loaded.template;
        state.declare(&template.parameters, Some(&template.name), &self.resolver, env);

        let skip = !template.skip_if_all_missing.is_empty()
            && template
                .skip_if_all_missing
                .iter()
                .all(|id| !state.inputs.contains_key(id));
        if skip {
            debug!("Skipping template {}: none of {:?} supplied", template.name, template.skip_if_all_missing);
            state.steps.push(Step::Skipped {
                template: template.name.clone(),
                phase,
                execute_on: template.execute_on,
                outputs: template
                    .commands
                    .iter()
                    .flat_map(|c| c.outputs.iter().map(|o| o.id.clone()))
                    .collect(),
            });
            return;
        }

        for (index, command) in template.commands.iter().enumerate() {
            let pointer = format!("/commands/{}", index);
            let CommandAction::Include(name) = &command.action else {
                state.steps.push(Step::Command {
                    template: template.name.clone(),
                    phase,
                    execute_on: template.execute_on,
                    document: Arc::clone(&loaded.document),
                    pointer,
                    command: command.clone(),
                });
                continue;
            };

            if depth >= MAX_TEMPLATE_DEPTH {
                state.errors.push(loaded.document.detail_at(
                    &format!("{}/template", pointer),
                    format!(
                        "Endless recursion detected: {} includes {} beyond depth {}",
                        loaded.reference, name, MAX_TEMPLATE_DEPTH
                    ),
                ));
                continue;
            }
            match self.catalog.load_template(name, &state.hierarchy) {
                Ok(included) => self.plan_template(state, &included, phase, depth + 1, env),
                Err(details) => state.errors.push(
                    loaded
                        .document
                        .detail_at(
                            &pointer,
                            format!("Template {} included by {} could not be loaded", name, loaded.reference),
                        )
                        .with_details(details),
                ),
            }
        }
    }

    /// Second pass: read, check and substitute each planned command.
    fn render_steps(&self, state: &mut Resolution) -> Vec<ResolvedCommand> {
        let steps = std::mem::take(&mut state.steps);
        let mut commands = Vec::with_capacity(steps.len());

        for step in steps {
            match step {
                Step::Skipped {
                    template,
                    phase,
                    execute_on,
                    outputs,
                } => {
                    state.declared_outputs.extend(outputs);
                    commands.push(ResolvedCommand {
                        name: format!("{} (skipped)", template),
                        template,
                        phase,
                        execute_on,
                        interpreter: "sh".to_string(),
                        script: "exit 0".to_string(),
                        outputs: Vec::new(),
                        skipped: true,
                    });
                }
                Step::Command {
                    template,
                    phase,
                    execute_on,
                    document,
                    pointer,
                    command,
                } => {
                    let name = command.name.clone().unwrap_or_else(|| template.clone());
                    let (interpreter, text) = match self.command_text(state, &document, &pointer, &command, phase) {
                        Ok(found) => found,
                        Err(detail) => {
                            state.errors.push(detail);
                            continue;
                        }
                    };

                    for variable in self.resolver.referenced_variables(&text) {
                        if !state.is_declared(&variable) {
                            state.errors.push(document.detail_at(
                                &pointer,
                                format!(
                                    "Command uses variable '{}' in '{}' but no such parameter is defined",
                                    variable, name
                                ),
                            ));
                        }
                    }

                    let script = self.substitute(state, &text);
                    state
                        .declared_outputs
                        .extend(command.outputs.iter().map(|o| o.id.clone()));
                    commands.push(ResolvedCommand {
                        name,
                        template,
                        phase,
                        execute_on,
                        interpreter,
                        script,
                        outputs: command.outputs,
                        skipped: false,
                    });
                }
            }
        }
        commands
    }

    /// Known values replace tokens. Outputs of earlier commands stay as
    /// tokens for the execution engine; other declared names without a value
    /// become [`NOT_DEFINED`].
    fn substitute(&self, state: &Resolution, text: &str) -> String {
        let lookup = state.lookup();
        self.resolver.replace_tokens(text, |name, token| {
            if let Some(value) = lookup.lookup(name) {
                value
            } else if state.declared_outputs.contains(name) {
                token.to_string()
            } else {
                NOT_DEFINED.to_string()
            }
        })
    }

    /// Interpreter and body of a shell or script command.
    fn command_text(
        &self,
        state: &Resolution,
        document: &JsonDocument,
        pointer: &str,
        command: &Command,
        phase: Phase,
    ) -> Result<(String, String), ErrorDetail> {
        match &command.action {
            CommandAction::Shell(line) => Ok(("sh".to_string(), line.clone())),
            CommandAction::Script { script, library } => {
                let body = self.read_script(state, document, pointer, "script", script, phase, "Script")?;
                let interpreter = interpreter_for(&body);
                let text = match library {
                    Some(library) => {
                        let lib = self.read_script(state, document, pointer, "library", library, phase, "Library")?;
                        format!("{}\n{}", lib, body)
                    }
                    None => body,
                };
                Ok((interpreter, text))
            }
            CommandAction::Include(name) => Err(document.detail_at(
                pointer,
                format!("Template {} cannot be used as a single command", name),
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read_script(
        &self,
        state: &Resolution,
        document: &JsonDocument,
        pointer: &str,
        field: &str,
        name: &str,
        phase: Phase,
        kind: &str,
    ) -> Result<String, ErrorDetail> {
        let located = format!("{}/{}", pointer, field);
        let path = self
            .catalog
            .repository()
            .find_script(name, &state.hierarchy, phase)
            .ok_or_else(|| document.detail_at(&located, format!("{} file not found: {}", kind, name)))?;
        std::fs::read_to_string(&path).map_err(|e| {
            document.detail_at(&located, format!("{} file {} could not be read: {}", kind, path.display(), e))
        })
    }

    /// Fill `enumValues` of parameters that name an `enumValuesTemplate`.
    fn resolve_enum_values(&self, state: &mut Resolution) {
        let pending: Vec<(usize, String, String)> = state
            .parameters
            .iter()
            .enumerate()
            .filter(|(_, p)| p.enum_values.is_empty())
            .filter_map(|(i, p)| Some((i, p.id.clone(), p.enum_values_template.clone()?)))
            .collect();

        for (index, id, template) in pending {
            match self.run_enum_template(state, &id, &template) {
                Ok(values) => state.parameters[index].enum_values = values,
                Err(detail) => state.errors.push(detail),
            }
        }
    }

    /// Describe mode runs nothing, but a missing `enumValuesTemplate` is
    /// still a configuration error.
    fn check_enum_templates(&self, state: &mut Resolution) {
        let referenced: Vec<(String, String)> = state
            .parameters
            .iter()
            .filter_map(|p| Some((p.id.clone(), p.enum_values_template.clone()?)))
            .collect();
        for (id, template) in referenced {
            if let Err(details) = self.catalog.load_template(&template, &state.hierarchy) {
                state.errors.push(
                    ErrorDetail::new(format!(
                        "enumValuesTemplate {} for parameter {}: template could not be loaded",
                        template, id
                    ))
                    .with_details(details),
                );
            }
        }
    }

    fn run_enum_template(&self, state: &Resolution, id: &str, template_name: &str) -> Result<Vec<Value>, ErrorDetail> {
        let context = |message: String| {
            ErrorDetail::new(format!(
                "enumValuesTemplate {} for parameter {}: {}",
                template_name, id, message
            ))
        };
        let provider = self
            .enum_provider
            .ok_or_else(|| context("no executor available".to_string()))?;
        let loaded = self
            .catalog
            .load_template(template_name, &state.hierarchy)
            .map_err(|details| context("template could not be loaded".to_string()).with_details(details))?;
        let Template {
            name,
            execute_on,
            commands,
            ..
        } = &loaded.template;
        let command = commands
            .first()
            .ok_or_else(|| context("template has no commands".to_string()))?;

        let phase = Phase::PreStart;
        let (interpreter, text) = self.command_text(state, &loaded.document, "/commands/0", command, phase)?;
        let resolved = ResolvedCommand {
            name: command.name.clone().unwrap_or_else(|| name.clone()),
            template: name.clone(),
            phase,
            execute_on: *execute_on,
            interpreter,
            script: self.resolver.substitute(&text, &state.lookup()),
            outputs: command.outputs.clone(),
            skipped: false,
        };

        let stdout = provider.enum_values(&resolved).map_err(context)?;
        match serde_json::from_str::<Value>(stdout.trim()) {
            Ok(Value::Array(values)) => Ok(values),
            _ => Err(context(format!("expected a JSON array, got '{}'", stdout.trim()))),
        }
    }
}
