//! Variable substitution.
//!
//! Two independent passes:
//! - `{{ name }}` tokens in command and script bodies, looked up through a
//!   [`ValueLookup`] chain;
//! - `${VAR:-default}` shell-style expressions in parameter defaults,
//!   expanded against an [`EnvMap`].

use std::collections::{BTreeMap, HashMap};

use regex::{Captures, Regex};
use serde_yaml::Value as YamlValue;

use crate::error::TemplateResult;

/// Replacement for a `{{ token }}` nothing could supply.
pub const NOT_DEFINED: &str = "NOT_DEFINED";

/// Whether `value` counts as missing.
pub fn is_absent(value: &str) -> bool {
    value.is_empty() || value == NOT_DEFINED
}

/// Source of token values.
pub trait ValueLookup {
    fn lookup(&self, name: &str) -> Option<String>;
}

impl ValueLookup for HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl ValueLookup for BTreeMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Explicit inputs, then defaults, then outputs. Absent values fall through.
pub struct LayeredLookup<'a> {
    pub inputs: &'a HashMap<String, String>,
    pub defaults: &'a HashMap<String, String>,
    pub outputs: &'a HashMap<String, String>,
}

impl ValueLookup for LayeredLookup<'_> {
    fn lookup(&self, name: &str) -> Option<String> {
        [self.inputs, self.defaults, self.outputs]
            .into_iter()
            .find_map(|layer| layer.get(name).filter(|v| !is_absent(v)))
            .cloned()
    }
}

/// Token and shell-default substitution engine.
pub struct VariableResolver {
    token_pattern: Regex,
    shell_pattern: Regex,
}

impl Default for VariableResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableResolver {
    pub fn new() -> Self {
        Self {
            // {{ name }} with optional whitespace inside the braces
            token_pattern: Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap(),
            // ${VAR} or ${VAR:-default}
            shell_pattern: Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap(),
        }
    }

    /// Replace every token; missing values become [`NOT_DEFINED`].
    pub fn substitute(&self, text: &str, lookup: &dyn ValueLookup) -> String {
        self.replace_tokens(text, |name, _| {
            lookup.lookup(name).unwrap_or_else(|| NOT_DEFINED.to_string())
        })
    }

    /// Replace tokens that have a value and leave the rest untouched.
    pub fn substitute_known(&self, text: &str, lookup: &dyn ValueLookup) -> String {
        self.replace_tokens(text, |name, token| {
            lookup.lookup(name).unwrap_or_else(|| token.to_string())
        })
    }

    /// Replace each token with `replace(name, original_token)`.
    pub fn replace_tokens(&self, text: &str, mut replace: impl FnMut(&str, &str) -> String) -> String {
        self.token_pattern
            .replace_all(text, |caps: &Captures| replace(&caps[1], &caps[0]))
            .into_owned()
    }

    /// Token names in order of first use.
    pub fn referenced_variables(&self, text: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for caps in self.token_pattern.captures_iter(text) {
            let name = &caps[1];
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }

    /// Expand `${VAR:-default}` and `${VAR}` against `env`.
    ///
    /// A present, non-empty value wins; otherwise the default text (or the
    /// empty string when none is given) is used.
    pub fn expand_shell_defaults(&self, text: &str, env: &EnvMap) -> String {
        self.shell_pattern
            .replace_all(text, |caps: &Captures| {
                match env.get(&caps[1]).filter(|v| !is_absent(v)) {
                    Some(value) => value.to_string(),
                    None => caps.get(2).map_or("", |m| m.as_str()).to_string(),
                }
            })
            .into_owned()
    }

    /// `(VAR, default)` pairs of every `${VAR:-default}` in `text`.
    fn shell_defaults<'t>(&self, text: &'t str) -> Vec<(&'t str, &'t str)> {
        self.shell_pattern
            .captures_iter(text)
            .filter_map(|caps| {
                let name = caps.get(1)?.as_str();
                let default = caps.get(2)?.as_str();
                Some((name, default))
            })
            .collect()
    }
}

/// Environment used for `${VAR:-default}` expansion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvMap {
    values: BTreeMap<String, String>,
}

impl EnvMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `other` wins on conflicts.
    pub fn merged(mut self, other: EnvMap) -> Self {
        self.values.extend(other.values);
        self
    }

    /// Parse `.env` text: `KEY=value` lines, `#` comments, optional `export`,
    /// single or double quotes.
    pub fn from_env_file(text: &str) -> Self {
        let mut env = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            env.insert(key, unquote(value.trim()));
        }
        env
    }

    /// Defaults declared by a docker-compose file.
    ///
    /// Collects literal `services.*.environment` entries (list or map form)
    /// and every `${VAR:-default}` anywhere in the file. Literal entries win.
    pub fn from_compose(text: &str) -> TemplateResult<Self> {
        let resolver = VariableResolver::new();
        let mut env = Self::new();
        for (name, default) in resolver.shell_defaults(text) {
            env.values
                .entry(name.to_string())
                .or_insert_with(|| default.to_string());
        }

        let compose: YamlValue = serde_yaml::from_str(text)?;
        let Some(services) = compose.get("services").and_then(YamlValue::as_mapping) else {
            return Ok(env);
        };
        for service in services.values() {
            match service.get("environment") {
                Some(YamlValue::Sequence(entries)) => {
                    for entry in entries.iter().filter_map(YamlValue::as_str) {
                        if let Some((key, value)) = entry.split_once('=') {
                            env.insert_literal(key, value);
                        }
                    }
                }
                Some(YamlValue::Mapping(entries)) => {
                    for (key, value) in entries {
                        if let (Some(key), Some(value)) = (key.as_str(), yaml_scalar(value)) {
                            env.insert_literal(key, &value);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(env)
    }

    /// Insert unless the value is itself an expression.
    fn insert_literal(&mut self, key: &str, value: &str) {
        if !value.contains("${") {
            self.insert(key.trim(), value.trim());
        }
    }
}

fn unquote(value: &str) -> String {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].to_string();
        }
    }
    match value.find(" #") {
        Some(index) => value[..index].trim_end().to_string(),
        None => value.to_string(),
    }
}

fn yaml_scalar(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_substitute_with_whitespace_and_missing() {
        let resolver = VariableResolver::new();
        let values = map(&[("hostname", "web01"), ("vm_id", "105")]);
        let rendered = resolver.substitute("pct set {{vm_id}} --hostname {{  hostname }} {{ Hostname }}", &values);
        assert_eq!(rendered, "pct set 105 --hostname web01 NOT_DEFINED");
    }

    #[test]
    fn test_substitute_known_keeps_unknown_tokens() {
        let resolver = VariableResolver::new();
        let values = map(&[("a", "1")]);
        assert_eq!(resolver.substitute_known("{{ a }} {{ b }}", &values), "1 {{ b }}");
    }

    #[test]
    fn test_layered_lookup_precedence() {
        let inputs = map(&[("a", "input"), ("b", "")]);
        let defaults = map(&[("a", "default"), ("b", "default-b"), ("c", "default-c")]);
        let outputs = map(&[("c", "output"), ("d", "output-d")]);
        let lookup = LayeredLookup {
            inputs: &inputs,
            defaults: &defaults,
            outputs: &outputs,
        };
        assert_eq!(lookup.lookup("a").as_deref(), Some("input"));
        assert_eq!(lookup.lookup("b").as_deref(), Some("default-b"));
        assert_eq!(lookup.lookup("c").as_deref(), Some("default-c"));
        assert_eq!(lookup.lookup("d").as_deref(), Some("output-d"));
        assert_eq!(lookup.lookup("e"), None);
    }

    #[test]
    fn test_referenced_variables_dedup_in_order() {
        let resolver = VariableResolver::new();
        assert_eq!(
            resolver.referenced_variables("{{ b }} {{a}} {{ b }} {{ not valid }}"),
            vec!["b".to_string(), "a".to_string()]
        );
    }

    #[test]
    fn test_shell_default_round_trip() {
        let resolver = VariableResolver::new();
        let env = EnvMap::new().with("API_LOGIN_PASSWORD", "secure_password");
        assert_eq!(
            resolver.expand_shell_defaults("${API_LOGIN_PASSWORD:-api_login_123}", &env),
            "secure_password"
        );
        assert_eq!(
            resolver.expand_shell_defaults("${API_LOGIN_PASSWORD:-api_login_123}", &EnvMap::new()),
            "api_login_123"
        );
    }

    #[test]
    fn test_shell_default_empty_and_sentinel_are_absent() {
        let resolver = VariableResolver::new();
        let env = EnvMap::new().with("A", "").with("B", NOT_DEFINED).with("C", "set");
        assert_eq!(resolver.expand_shell_defaults("${A:-x}-${B:-y}-${C}-${D}", &env), "x-y-set-");
    }

    #[test]
    fn test_env_file_parsing() {
        let env = EnvMap::from_env_file(
            "# comment\nexport DB_USER=admin\nDB_PASS=\"p@ss word\"\nPORT=8080 # http\nEMPTY=\n=bad\n",
        );
        assert_eq!(env.get("DB_USER"), Some("admin"));
        assert_eq!(env.get("DB_PASS"), Some("p@ss word"));
        assert_eq!(env.get("PORT"), Some("8080"));
        assert_eq!(env.get("EMPTY"), Some(""));
        assert_eq!(env.len(), 4);
    }

    #[test]
    fn test_compose_defaults() {
        let compose = r#"
services:
  app:
    image: "example/app:${APP_TAG:-1.2}"
    environment:
      - TZ=Europe/Berlin
      - API_KEY=${API_KEY:-changeme}
  db:
    environment:
      POSTGRES_DB: app
      POSTGRES_PORT: 5432
"#;
        let env = EnvMap::from_compose(compose).unwrap();
        assert_eq!(env.get("APP_TAG"), Some("1.2"));
        assert_eq!(env.get("API_KEY"), Some("changeme"));
        assert_eq!(env.get("TZ"), Some("Europe/Berlin"));
        assert_eq!(env.get("POSTGRES_PORT"), Some("5432"));

        let merged = env.merged(EnvMap::from_env_file("API_KEY=real"));
        assert_eq!(merged.get("API_KEY"), Some("real"));
    }
}
