//! Integration tests for application and template resolution.

use std::fs;
use std::path::Path;

use pve_templates::{
    ApplicationLoader, Catalog, ConfigurationError, EnvMap, Layer, LoadRequest, LoadedApplication,
    Phase, Task, TemplateProcessor, VariableResolver,
};
use regex::Regex;
use tempfile::{tempdir, TempDir};

struct Fixture {
    temp: TempDir,
    catalog: Catalog,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempdir().unwrap();
        let catalog = Catalog::open(temp.path().join("local"), temp.path().join("json")).unwrap();
        Self { temp, catalog }
    }

    fn write(&self, relative: &str, content: &str) {
        let path = self.temp.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    /// Shared template with one echo command.
    fn echo_template(&self, name: &str) {
        self.write(
            &format!("json/shared/templates/{}.json", name),
            &format!(
                r#"{{"execute_on": "ve", "name": "{0}", "commands": [{{"command": "echo {0}"}}]}}"#,
                name
            ),
        );
    }

    fn load(&self, request: &LoadRequest) -> Result<LoadedApplication, ConfigurationError> {
        TemplateProcessor::new(&self.catalog).load_application(request)
    }

    fn root(&self) -> &Path {
        self.temp.path()
    }
}

fn command_names(loaded: &LoadedApplication) -> Vec<&str> {
    loaded.commands.iter().map(|c| c.name.as_str()).collect()
}

#[test]
fn test_inheritance_merge_order() {
    let fx = Fixture::new();
    for name in ["x", "y", "z"] {
        fx.echo_template(name);
    }
    fx.write(
        "json/applications/base/application.json",
        r#"{"name": "Base", "installation": {"pre_start": ["x", "y"]}}"#,
    );
    fx.write(
        "json/applications/child/application.json",
        r#"{"name": "Child", "extends": "base", "installation": {"pre_start": [{"name": "z", "before": "y"}]}}"#,
    );

    let loaded = fx.load(&LoadRequest::new("child", Task::Installation)).unwrap();
    assert_eq!(command_names(&loaded), vec!["x", "z", "y"]);
    assert_eq!(loaded.hierarchy.len(), 2);
}

#[test]
fn test_same_name_extension_uses_shared_layer() {
    let fx = Fixture::new();
    for name in ["shared-step", "local-step"] {
        fx.echo_template(name);
    }
    fx.write(
        "json/applications/nginx/application.json",
        r#"{"name": "Nginx", "installation": ["shared-step"]}"#,
    );
    fx.write(
        "local/applications/nginx/application.json",
        r#"{"name": "Nginx (site)", "extends": "json:nginx", "installation": [{"name": "local-step", "after": "shared-step"}]}"#,
    );

    let loaded = fx.load(&LoadRequest::new("nginx", Task::Installation)).unwrap();
    assert_eq!(command_names(&loaded), vec!["shared-step", "local-step"]);
    assert_eq!(loaded.hierarchy[0].layer, Some(Layer::Local));
    assert_eq!(loaded.hierarchy[1].layer, Some(Layer::Json));

    // Unqualified same-name extends from the local layer means the same thing.
    fx.write(
        "local/applications/nginx/application.json",
        r#"{"name": "Nginx (site)", "extends": "nginx", "installation": ["local-step"]}"#,
    );
    fx.catalog.cache().clear();
    let loaded = fx.load(&LoadRequest::new("nginx", Task::Installation)).unwrap();
    assert_eq!(command_names(&loaded), vec!["shared-step", "local-step"]);
}

#[test]
fn test_self_extension_is_rejected_every_time() {
    let fx = Fixture::new();
    fx.write(
        "json/applications/loop/application.json",
        r#"{"name": "Loop", "extends": "loop", "installation": []}"#,
    );

    let loader = ApplicationLoader::new(&fx.catalog);
    for _ in 0..2 {
        let err = loader.read_application("loop", &Task::Installation).unwrap_err();
        assert!(err.messages()[0].starts_with("Cyclic extends detected"));
    }
}

#[test]
fn test_skipped_template_keeps_its_position() {
    let fx = Fixture::new();
    fx.echo_template("first");
    fx.echo_template("last");
    fx.write(
        "json/shared/templates/mount.json",
        r#"{"execute_on": "ve", "name": "Mount volumes", "skip_if_all_missing": ["volumes", "bind_mounts"],
            "parameters": [{"id": "volumes"}, {"id": "bind_mounts"}],
            "commands": [{"command": "mount {{ volumes }} {{ bind_mounts }}"}]}"#,
    );
    fx.write(
        "json/applications/app/application.json",
        r#"{"name": "App", "installation": ["first", "mount", "last"]}"#,
    );

    let loaded = fx.load(&LoadRequest::new("app", Task::Installation)).unwrap();
    assert_eq!(command_names(&loaded), vec!["first", "Mount volumes (skipped)", "last"]);
    assert_eq!(loaded.commands[1].script, "exit 0");
    assert!(loaded.commands[1].skipped);

    let loaded = fx
        .load(&LoadRequest::new("app", Task::Installation).with_input("volumes", "data:/srv"))
        .unwrap();
    assert_eq!(loaded.commands[1].script, "mount data:/srv NOT_DEFINED");
}

#[test]
fn test_undefined_variable_is_fatal() {
    let fx = Fixture::new();
    fx.write(
        "json/shared/templates/bad.json",
        r#"{"execute_on": "ve", "name": "Bad", "commands": [{"command": "echo {{ missing_param }}"}]}"#,
    );
    fx.write(
        "json/applications/app/application.json",
        r#"{"name": "App", "installation": ["bad"]}"#,
    );

    let err = fx.load(&LoadRequest::new("app", Task::Installation)).unwrap_err();
    let pattern = Regex::new(r"Command uses variable.*missing_param").unwrap();
    assert!(err.messages().iter().any(|m| pattern.is_match(m)), "{}", err.render());
}

#[test]
fn test_missing_script_is_fatal() {
    let fx = Fixture::new();
    fx.write(
        "json/shared/templates/run.json",
        r#"{"execute_on": "lxc", "name": "Run", "commands": [{"script": "does-not-exist.sh"}]}"#,
    );
    fx.write(
        "json/applications/app/application.json",
        r#"{"name": "App", "installation": {"post_start": ["run"]}}"#,
    );

    let err = fx.load(&LoadRequest::new("app", Task::Installation)).unwrap_err();
    assert!(err.render().contains("Script file not found: does-not-exist.sh"));
}

#[test]
fn test_shell_default_round_trip() {
    let resolver = VariableResolver::new();
    let text = "${API_LOGIN_PASSWORD:-api_login_123}";
    let env = EnvMap::from_env_file("API_LOGIN_PASSWORD=secure_password\n");
    assert_eq!(resolver.expand_shell_defaults(text, &env), "secure_password");
    assert_eq!(resolver.expand_shell_defaults(text, &EnvMap::new()), "api_login_123");
}

#[test]
fn test_addon_compatibility_by_tag_and_wildcard() {
    let fx = Fixture::new();
    for name in ["install", "samba-setup", "usb-setup", "db-setup"] {
        fx.echo_template(name);
    }
    fx.write(
        "json/applications/files/application.json",
        r#"{"name": "Files", "tags": ["storage"], "installation": {"post_start": ["install"]}}"#,
    );
    fx.write(
        "json/addons/samba.json",
        r#"{"name": "Samba", "compatible_with": ["tag:storage"], "post_start": ["samba-setup"],
            "properties": [{"id": "share_name", "value": "files"}]}"#,
    );
    fx.write(
        "json/addons/usb.json",
        r#"{"name": "USB", "compatible_with": "*", "pre_start": ["usb-setup"]}"#,
    );
    fx.write(
        "json/addons/postgres.json",
        r#"{"name": "Postgres", "compatible_with": ["tag:database"], "post_start": ["db-setup"]}"#,
    );

    let request = LoadRequest::new("files", Task::Installation).with_addons(vec![
        "samba".to_string(),
        "usb".to_string(),
        "postgres".to_string(),
        "no-such-addon".to_string(),
    ]);
    let loaded = fx.load(&request).unwrap();
    assert_eq!(command_names(&loaded), vec!["usb-setup", "install", "samba-setup"]);
    assert_eq!(loaded.selected_addons, vec!["samba".to_string(), "usb".to_string()]);
    assert_eq!(loaded.commands[0].phase, Phase::PreStart);
}

#[test]
fn test_addon_reconfigure_only_uses_post_start() {
    let fx = Fixture::new();
    for name in ["usb-map", "usb-check"] {
        fx.echo_template(name);
    }
    fx.write("json/applications/app/application.json", r#"{"name": "App"}"#);
    fx.write(
        "json/addons/usb.json",
        r#"{"name": "USB", "compatible_with": "*", "pre_start": ["usb-map"], "post_start": ["usb-check"]}"#,
    );

    let loaded = fx
        .load(&LoadRequest::new("app", Task::AddonReconfigure).with_addons(vec!["usb".to_string()]))
        .unwrap();
    assert_eq!(command_names(&loaded), vec!["usb-check"]);
}

/// App with installation/backup/copy-upgrade lists and a usb addon covering every phase.
fn addon_phase_fixture() -> Fixture {
    let fx = Fixture::new();
    for name in ["install", "backup-step", "copy-step", "usb-map", "usb-check", "usb-upgrade"] {
        fx.echo_template(name);
    }
    fx.write(
        "json/applications/app/application.json",
        r#"{"name": "App", "installation": ["install"], "backup": ["backup-step"], "copy-upgrade": ["copy-step"]}"#,
    );
    fx.write(
        "json/addons/usb.json",
        r#"{"name": "USB", "compatible_with": "*", "pre_start": ["usb-map"],
            "post_start": ["usb-check"], "upgrade": ["usb-upgrade"]}"#,
    );
    fx
}

#[test]
fn test_installation_skips_addon_upgrade_templates() {
    let fx = addon_phase_fixture();
    let loaded = fx
        .load(&LoadRequest::new("app", Task::Installation).with_addons(vec!["usb".to_string()]))
        .unwrap();
    assert_eq!(command_names(&loaded), vec!["install", "usb-map", "usb-check"]);
}

#[test]
fn test_copy_upgrade_only_uses_addon_upgrade() {
    let fx = addon_phase_fixture();
    let loaded = fx
        .load(&LoadRequest::new("app", Task::CopyUpgrade).with_addons(vec!["usb".to_string()]))
        .unwrap();
    assert_eq!(command_names(&loaded), vec!["copy-step", "usb-upgrade"]);
    assert!(loaded.commands.iter().all(|c| c.phase == Phase::Upgrade));
}

#[test]
fn test_backup_gets_no_addon_upgrade_or_post_start() {
    let fx = addon_phase_fixture();
    let loaded = fx
        .load(&LoadRequest::new("app", Task::Backup).with_addons(vec!["usb".to_string()]))
        .unwrap();
    assert_eq!(command_names(&loaded), vec!["backup-step", "usb-map"]);
}

#[test]
fn test_addon_properties_and_selection_are_substituted() {
    let fx = Fixture::new();
    fx.write(
        "json/shared/templates/notes.json",
        r#"{"execute_on": "ve", "name": "Notes", "commands": [{"command": "notes {{ selected_addons }} {{ share_name }}"}]}"#,
    );
    fx.write(
        "json/applications/app/application.json",
        r#"{"name": "App", "tags": ["storage"], "installation": ["notes"]}"#,
    );
    fx.write(
        "json/addons/samba.json",
        r#"{"name": "Samba", "compatible_with": ["app"], "properties": [{"id": "share_name", "value": "files"}]}"#,
    );

    let loaded = fx
        .load(&LoadRequest::new("app", Task::Installation).with_addons(vec!["samba".to_string()]))
        .unwrap();
    assert_eq!(loaded.commands[0].script, "notes samba files");
}

#[test]
fn test_recursion_bound() {
    let fx = Fixture::new();
    fx.write(
        "json/shared/templates/again.json",
        r#"{"execute_on": "ve", "name": "Again", "commands": [{"template": "again"}]}"#,
    );
    fx.write(
        "json/applications/app/application.json",
        r#"{"name": "App", "installation": ["again"]}"#,
    );

    let err = fx.load(&LoadRequest::new("app", Task::Installation)).unwrap_err();
    assert_eq!(err.details.len(), 1);
    assert!(err.messages()[0].starts_with("Endless recursion detected"));
}

#[test]
fn test_included_template_is_inlined() {
    let fx = Fixture::new();
    fx.echo_template("inner");
    fx.write(
        "json/shared/templates/outer.json",
        r#"{"execute_on": "ve", "name": "Outer", "commands": [
            {"name": "before", "command": "true"},
            {"template": "inner"},
            {"name": "after", "command": "true"}
        ]}"#,
    );
    fx.write(
        "json/applications/app/application.json",
        r#"{"name": "App", "installation": ["outer"]}"#,
    );

    let loaded = fx.load(&LoadRequest::new("app", Task::Installation)).unwrap();
    assert_eq!(command_names(&loaded), vec!["before", "inner", "after"]);
}

#[test]
fn test_application_template_shadows_shared() {
    let fx = Fixture::new();
    fx.echo_template("start");
    fx.write(
        "json/applications/app/templates/start.json",
        r#"{"execute_on": "ve", "name": "App start", "commands": [{"command": "echo own"}]}"#,
    );
    fx.write(
        "json/applications/app/application.json",
        r#"{"name": "App", "installation": ["start"]}"#,
    );

    let loaded = fx.load(&LoadRequest::new("app", Task::Installation)).unwrap();
    assert_eq!(loaded.commands[0].script, "echo own");
}

#[test]
fn test_schema_error_points_at_line() {
    let fx = Fixture::new();
    fx.write(
        "json/shared/templates/wrong.json",
        "{\n  \"execute_on\": \"ve\",\n  \"name\": \"Wrong\",\n  \"commands\": [\n    {\"command\": \"a\", \"script\": \"b.sh\"}\n  ]\n}",
    );
    fx.write(
        "json/applications/app/application.json",
        r#"{"name": "App", "installation": ["wrong"]}"#,
    );

    let err = fx.load(&LoadRequest::new("app", Task::Installation)).unwrap_err();
    let nested = &err.details[0].details;
    assert!(!nested.is_empty());
    assert_eq!(nested[0].line, Some(5));
    assert!(nested[0].file.as_ref().unwrap().ends_with("wrong.json"));
}

#[test]
fn test_edit_is_seen_after_cache_bust() {
    let fx = Fixture::new();
    fx.echo_template("step");
    fx.write(
        "json/applications/app/application.json",
        r#"{"name": "App", "installation": ["step"]}"#,
    );
    assert_eq!(
        fx.load(&LoadRequest::new("app", Task::Installation)).unwrap().commands[0].script,
        "echo step"
    );

    let path = fx.root().join("json/shared/templates/step.json");
    fs::write(
        &path,
        r#"{"execute_on": "ve", "name": "step", "commands": [{"command": "echo changed"}]}"#,
    )
    .unwrap();
    fx.catalog.cache().invalidate(&path);
    assert_eq!(
        fx.load(&LoadRequest::new("app", Task::Installation)).unwrap().commands[0].script,
        "echo changed"
    );
}
