//! Document model for applications, templates and addons.
//!
//! These types mirror the JSON documents stored in the repository layers.
//! Wire shapes that accept several forms (a template reference given as a
//! bare string or as an object, a command that is either a shell line, a
//! script or an include) are converted into tagged enums on load.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorDetail;

/// Sub-ordering within a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Host side, before the container starts.
    PreStart,
    /// Inside the container, after it started.
    PostStart,
    Upgrade,
}

impl Phase {
    /// Phases in execution order.
    pub const ALL: [Phase; 3] = [Phase::PreStart, Phase::PostStart, Phase::Upgrade];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreStart => "pre_start",
            Self::PostStart => "post_start",
            Self::Upgrade => "upgrade",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named workflow an application supports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Task {
    Installation,
    Upgrade,
    Backup,
    Restore,
    AddonReconfigure,
    CopyUpgrade,
    Custom(String),
}

impl Task {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Installation => "installation",
            Self::Upgrade => "upgrade",
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::AddonReconfigure => "addon-reconfigure",
            Self::CopyUpgrade => "copy-upgrade",
            Self::Custom(s) => s.as_str(),
        }
    }

    /// Phase a bare template list of this task belongs to.
    pub fn default_phase(&self) -> Phase {
        match self {
            Self::Upgrade | Self::CopyUpgrade => Phase::Upgrade,
            Self::AddonReconfigure => Phase::PostStart,
            _ => Phase::PreStart,
        }
    }

    /// Addon phases spliced into this task.
    ///
    /// An installation runs both sides of container start; every other task
    /// only gets the addon templates of its own phase.
    pub fn addon_phases(&self) -> &'static [Phase] {
        match self {
            Self::Installation => &[Phase::PreStart, Phase::PostStart],
            Self::Upgrade | Self::CopyUpgrade => &[Phase::Upgrade],
            Self::AddonReconfigure => &[Phase::PostStart],
            Self::Backup | Self::Restore | Self::Custom(_) => &[Phase::PreStart],
        }
    }
}

impl FromStr for Task {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "installation" => Self::Installation,
            "upgrade" => Self::Upgrade,
            "backup" => Self::Backup,
            "restore" => Self::Restore,
            "addon-reconfigure" => Self::AddonReconfigure,
            "copy-upgrade" => Self::CopyUpgrade,
            other => Self::Custom(other.to_string()),
        })
    }
}

impl From<String> for Task {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(task) => task,
            Err(never) => match never {},
        }
    }
}

impl From<Task> for String {
    fn from(task: Task) -> Self {
        task.as_str().to_string()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a template's commands run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecuteOn {
    /// The Proxmox VE host.
    #[default]
    Ve,
    /// Inside the LXC container.
    Lxc,
}

/// Side of the anchor a positioned reference is inserted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertSide {
    Before,
    After,
}

/// Reference to a template inside a task or addon phase list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawTemplateRef", into = "RawTemplateRef")]
pub enum TemplateRef {
    Bare(String),
    Positioned {
        name: String,
        anchor: String,
        side: InsertSide,
    },
}

impl TemplateRef {
    pub fn bare(name: impl Into<String>) -> Self {
        Self::Bare(name.into())
    }

    pub fn before(name: impl Into<String>, anchor: impl Into<String>) -> Self {
        Self::Positioned {
            name: name.into(),
            anchor: anchor.into(),
            side: InsertSide::Before,
        }
    }

    pub fn after(name: impl Into<String>, anchor: impl Into<String>) -> Self {
        Self::Positioned {
            name: name.into(),
            anchor: anchor.into(),
            side: InsertSide::After,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Bare(name) | Self::Positioned { name, .. } => name,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawTemplateRef {
    Name(String),
    Object {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<String>,
    },
}

impl From<RawTemplateRef> for TemplateRef {
    fn from(raw: RawTemplateRef) -> Self {
        match raw {
            RawTemplateRef::Name(name) => Self::Bare(name),
            RawTemplateRef::Object {
                name,
                before: Some(anchor),
                ..
            } => Self::before(name, anchor),
            RawTemplateRef::Object {
                name,
                after: Some(anchor),
                ..
            } => Self::after(name, anchor),
            RawTemplateRef::Object { name, .. } => Self::Bare(name),
        }
    }
}

impl From<TemplateRef> for RawTemplateRef {
    fn from(entry: TemplateRef) -> Self {
        match entry {
            TemplateRef::Bare(name) => Self::Name(name),
            TemplateRef::Positioned { name, anchor, side } => match side {
                InsertSide::Before => Self::Object {
                    name,
                    before: Some(anchor),
                    after: None,
                },
                InsertSide::After => Self::Object {
                    name,
                    before: None,
                    after: Some(anchor),
                },
            },
        }
    }
}

/// Insert `entry` into `list` following its positioning directive.
///
/// Anchors match the first entry with that name; a missing anchor appends.
fn insert_template_ref(mut list: Vec<TemplateRef>, entry: &TemplateRef) -> Vec<TemplateRef> {
    let position = match entry {
        TemplateRef::Bare(_) => None,
        TemplateRef::Positioned { anchor, side, .. } => list
            .iter()
            .position(|existing| existing.name() == anchor)
            .map(|index| match side {
                InsertSide::Before => index,
                InsertSide::After => index + 1,
            }),
    };
    match position {
        Some(index) => list.insert(index, entry.clone()),
        None => list.push(entry.clone()),
    }
    list
}

/// Build a new list with `additions` applied on top of `base`, in order.
pub fn merge_template_refs(base: &[TemplateRef], additions: &[TemplateRef]) -> Vec<TemplateRef> {
    additions
        .iter()
        .fold(base.to_vec(), |list, entry| insert_template_ref(list, entry))
}

/// Template references grouped by phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTemplates {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_start: Vec<TemplateRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_start: Vec<TemplateRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upgrade: Vec<TemplateRef>,
}

impl PhaseTemplates {
    pub fn get(&self, phase: Phase) -> &[TemplateRef] {
        match phase {
            Phase::PreStart => &self.pre_start,
            Phase::PostStart => &self.post_start,
            Phase::Upgrade => &self.upgrade,
        }
    }

    pub fn with_phase(mut self, phase: Phase, templates: Vec<TemplateRef>) -> Self {
        match phase {
            Phase::PreStart => self.pre_start = templates,
            Phase::PostStart => self.post_start = templates,
            Phase::Upgrade => self.upgrade = templates,
        }
        self
    }

    /// Apply `child` on top of `self`, phase by phase.
    pub fn merged(&self, child: &PhaseTemplates) -> PhaseTemplates {
        Phase::ALL.iter().fold(PhaseTemplates::default(), |acc, &phase| {
            acc.with_phase(phase, merge_template_refs(self.get(phase), child.get(phase)))
        })
    }

    pub fn is_empty(&self) -> bool {
        Phase::ALL.iter().all(|&phase| self.get(phase).is_empty())
    }

    /// Number of references across all phases.
    pub fn len(&self) -> usize {
        Phase::ALL.iter().map(|&phase| self.get(phase).len()).sum()
    }
}

/// Task entry of an application: a bare list or a phase map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TaskTemplates {
    List(Vec<TemplateRef>),
    Phases(PhaseTemplates),
}

/// Parameter value type.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    #[default]
    String,
    Number,
    Boolean,
    Enum,
    #[serde(other)]
    Other,
}

/// A named input slot declared by a template, application or addon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub advanced: bool,
    #[serde(default)]
    pub upload: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certtype: Option<String>,
    #[serde(rename = "enumValues", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
    #[serde(rename = "enumValuesTemplate", default, skip_serializing_if = "Option::is_none")]
    pub enum_values_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templatename: Option<String>,
}

impl Parameter {
    /// Default rendered as text; `null` counts as no default.
    pub fn default_text(&self) -> Option<String> {
        self.default.as_ref().and_then(value_text)
    }
}

/// Text form of a JSON scalar.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// An output a command promises to print on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawOutput")]
pub struct OutputDecl {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOutput {
    Id(String),
    Object {
        id: String,
        #[serde(default)]
        default: Option<Value>,
    },
}

impl From<RawOutput> for OutputDecl {
    fn from(raw: RawOutput) -> Self {
        match raw {
            RawOutput::Id(id) => Self { id, default: None },
            RawOutput::Object { id, default } => Self { id, default },
        }
    }
}

/// What a template command does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAction {
    /// Inline shell line.
    Shell(String),
    /// Script file, optionally with a library prepended.
    Script {
        script: String,
        library: Option<String>,
    },
    /// Inline another template's commands.
    Include(String),
}

/// One step of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCommand", into = "RawCommand")]
pub struct Command {
    pub name: Option<String>,
    pub description: Option<String>,
    pub action: CommandAction,
    pub outputs: Vec<OutputDecl>,
}

#[derive(Serialize, Deserialize)]
struct RawCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    library: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    template: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    outputs: Vec<OutputDecl>,
}

impl TryFrom<RawCommand> for Command {
    type Error = String;

    fn try_from(raw: RawCommand) -> Result<Self, Self::Error> {
        let action = match (raw.command, raw.script, raw.template) {
            (Some(command), None, None) => CommandAction::Shell(command),
            (None, Some(script), None) => CommandAction::Script {
                script,
                library: raw.library,
            },
            (None, None, Some(template)) => CommandAction::Include(template),
            _ => {
                return Err(
                    "command must have exactly one of 'command', 'script' or 'template'".to_string(),
                )
            }
        };
        Ok(Self {
            name: raw.name,
            description: raw.description,
            action,
            outputs: raw.outputs,
        })
    }
}

impl From<Command> for RawCommand {
    fn from(command: Command) -> Self {
        let mut raw = RawCommand {
            name: command.name,
            description: command.description,
            command: None,
            script: None,
            library: None,
            template: None,
            outputs: command.outputs,
        };
        match command.action {
            CommandAction::Shell(line) => raw.command = Some(line),
            CommandAction::Script { script, library } => {
                raw.script = Some(script);
                raw.library = library;
            }
            CommandAction::Include(template) => raw.template = Some(template),
        }
        raw
    }
}

/// A task step document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub execute_on: ExecuteOn,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_if_all_missing: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub commands: Vec<Command>,
}

/// A deployable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    /// Directory name the document was loaded from.
    #[serde(skip)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    /// Task entries and any other top-level keys, interpreted on demand.
    #[serde(flatten)]
    pub tasks: BTreeMap<String, Value>,
}

impl Application {
    /// Template references this application declares for `task`, before
    /// inheritance is applied.
    pub fn task_templates(&self, task: &Task) -> Result<Option<PhaseTemplates>, ErrorDetail> {
        let Some(value) = self.tasks.get(task.as_str()) else {
            return Ok(None);
        };
        let entry: TaskTemplates = serde_json::from_value(value.clone()).map_err(|e| {
            ErrorDetail::new(format!(
                "Task '{}' of application '{}' is malformed: {}",
                task, self.name, e
            ))
        })?;
        Ok(Some(match entry {
            TaskTemplates::List(list) => {
                PhaseTemplates::default().with_phase(task.default_phase(), list)
            }
            TaskTemplates::Phases(phases) => phases,
        }))
    }

    /// JSON pointer of the `index`-th reference of `task` in `phase`.
    pub fn task_pointer(&self, task: &Task, phase: Phase, index: usize) -> String {
        match self.tasks.get(task.as_str()) {
            Some(Value::Array(_)) => format!("/{}/{}", task, index),
            _ => format!("/{}/{}/{}", task, phase, index),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Which applications an addon applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawCompatibleWith", into = "RawCompatibleWith")]
pub enum CompatibleWith {
    All,
    Only(Vec<String>),
}

impl Default for CompatibleWith {
    fn default() -> Self {
        Self::Only(Vec::new())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawCompatibleWith {
    One(String),
    Many(Vec<String>),
}

impl From<RawCompatibleWith> for CompatibleWith {
    fn from(raw: RawCompatibleWith) -> Self {
        match raw {
            RawCompatibleWith::One(s) if s == "*" => Self::All,
            RawCompatibleWith::One(s) => Self::Only(vec![s]),
            RawCompatibleWith::Many(list) if list.iter().any(|s| s == "*") => Self::All,
            RawCompatibleWith::Many(list) => Self::Only(list),
        }
    }
}

impl From<CompatibleWith> for RawCompatibleWith {
    fn from(compat: CompatibleWith) -> Self {
        match compat {
            CompatibleWith::All => Self::One("*".to_string()),
            CompatibleWith::Only(list) => Self::Many(list),
        }
    }
}

/// Static value an addon injects as if a command had printed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddonProperty {
    pub id: String,
    pub value: Value,
}

/// Rename of an extracted addon parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterOverride {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Optional feature bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Addon {
    /// File stem the document was loaded from.
    #[serde(skip)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub compatible_with: CompatibleWith,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes_key: Option<String>,
    #[serde(default)]
    pub properties: Vec<AddonProperty>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(rename = "parameterOverrides", default)]
    pub parameter_overrides: Vec<ParameterOverride>,
    #[serde(flatten)]
    pub templates: PhaseTemplates,
}

/// Input value supplied by the caller (`parameters.json` entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterValue {
    pub name: String,
    pub value: Value,
}

impl ParameterValue {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A fully substituted command ready for the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedCommand {
    pub name: String,
    pub template: String,
    pub phase: Phase,
    pub execute_on: ExecuteOn,
    /// Program the script is piped into (`sh`, `python3`, ...).
    pub interpreter: String,
    pub script: String,
    #[serde(default)]
    pub outputs: Vec<OutputDecl>,
    #[serde(default)]
    pub skipped: bool,
}

/// Interpreter named by a script's shebang line, `sh` otherwise.
pub fn interpreter_for(script: &str) -> String {
    let Some(shebang) = script.lines().next().and_then(|l| l.strip_prefix("#!")) else {
        return "sh".to_string();
    };
    let mut parts = shebang.split_whitespace();
    let program = parts.next().unwrap_or("sh");
    let program = if program.ends_with("/env") {
        parts.next().unwrap_or("sh")
    } else {
        program.rsplit('/').next().unwrap_or(program)
    };
    program.to_string()
}
