mod common;

use common::write_script;
use reel_runner::errors::ScriptError;
use reel_runner::resolver::ScriptResolver;
use reel_runner::step::StepKind;
use serde_json::{json, Value};

fn raws(steps: &[reel_runner::Step]) -> Vec<Value> {
    steps.iter().map(|s| s.raw.clone()).collect()
}

#[test]
fn test_parent_steps_run_before_child_steps() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        "base.yaml",
        "name: base\nconfig:\n  runner:\n    max_attempts: 2\nsteps:\n  - log: P1\n  - log: P2\nteardown:\n  - log: parent-teardown\n",
    );
    let child = write_script(
        dir.path(),
        "child.yaml",
        "extends: base\nconfig:\n  theme: dark\nsteps:\n  - log: C1\n",
    );

    let flat = ScriptResolver::new().resolve_file(&child).unwrap();
    assert_eq!(
        raws(&flat.steps),
        vec![json!({"log": "P1"}), json!({"log": "P2"}), json!({"log": "C1"})]
    );
    assert_eq!(flat.name.as_deref(), Some("base"));
    assert_eq!(flat.config["theme"], json!("dark"));
    assert_eq!(flat.config["runner"]["max_attempts"], json!(2));
    assert_eq!(raws(&flat.teardown), vec![json!({"log": "parent-teardown"})]);
    assert_eq!(flat.sources.len(), 2);
}

#[test]
fn test_origins_point_at_the_defining_file() {
    let dir = tempfile::tempdir().unwrap();
    let parent = write_script(dir.path(), "base.yaml", "steps:\n  - log: P1\n");
    let child = write_script(
        dir.path(),
        "child.yaml",
        "extends: base.yaml\nsteps:\n  - if: \"true\"\n    then:\n      - log: C1\n",
    );

    let flat = ScriptResolver::new().resolve_file(&child).unwrap();
    let parent_origin = flat.steps[0].origin.as_ref().unwrap();
    assert_eq!(parent_origin.path, parent.canonicalize().unwrap());
    assert_eq!(parent_origin.pointer, "/steps/0");

    let nested = flat.steps[1].children()[0];
    let nested_origin = nested.origin.as_ref().unwrap();
    assert_eq!(nested_origin.path, child.canonicalize().unwrap());
    assert_eq!(nested_origin.pointer, "/steps/0/then/0");
    assert!(nested.raw.get("__origin__").is_none());
}

#[test]
fn test_includes_are_prepended_and_missing_ones_skipped() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("includes")).unwrap();
    write_script(
        &dir.path().join("includes"),
        "login.yaml",
        "steps:\n  - navigate: https://app.test/login\n",
    );
    let main = write_script(
        dir.path(),
        "main.yaml",
        "includes: [login, not-there]\nsteps:\n  - click: Dashboard\n",
    );

    let flat = ScriptResolver::new().resolve_file(&main).unwrap();
    assert_eq!(
        raws(&flat.steps),
        vec![
            json!({"navigate": "https://app.test/login"}),
            json!({"click": "Dashboard"})
        ]
    );
}

#[test]
fn test_composition_expands_in_nested_lists() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        "fill_user.yaml",
        "steps:\n  - type:\n      target: User\n      text: \"{{ user }}\"\n",
    );
    let main = write_script(
        dir.path(),
        "main.yaml",
        "steps:\n  - compose: fill_user\n    params: {user: ada}\n  - if: \"x > 1\"\n    then:\n      - compose: fill_user\n        params: {user: bob}\n",
    );

    let flat = ScriptResolver::new().resolve_file(&main).unwrap();
    assert_eq!(flat.steps.len(), 2);

    let top = &flat.steps[0];
    let marker = top.compose.as_ref().unwrap();
    assert_eq!(marker.target, "fill_user");
    assert_eq!(marker.params["user"], json!("ada"));
    assert!(matches!(&top.kind, StepKind::Action { name, .. } if name == "type"));

    let nested = flat.steps[1].children()[0];
    assert_eq!(nested.compose.as_ref().unwrap().params["user"], json!("bob"));
    assert!(flat.sources.iter().any(|p| p.ends_with("fill_user.yaml")));
}

#[test]
fn test_missing_composition_target_is_left_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let main = write_script(dir.path(), "main.yaml", "steps:\n  - compose: nowhere\n");
    let flat = ScriptResolver::new().resolve_file(&main).unwrap();
    assert!(matches!(&flat.steps[0].kind, StepKind::Compose { target, .. } if target == "nowhere"));
}

#[test]
fn test_resolution_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "base.yaml", "steps:\n  - log: P1\n");
    write_script(dir.path(), "part.yaml", "steps:\n  - click: Save\n  - go_back\n");
    let main = write_script(
        dir.path(),
        "main.yaml",
        "extends: base\nsteps:\n  - compose: part\n    params: {n: 1}\n  - for: item in items\n    steps:\n      - log: \"{{ item }}\"\n",
    );

    let resolver = ScriptResolver::new();
    let flat = resolver.resolve_file(&main).unwrap();
    let again = resolver.resolve(&flat.to_script(), dir.path()).unwrap();
    assert_eq!(raws(&flat.steps), raws(&again.steps));
    assert_eq!(again.steps.len(), 4);

    let yaml = flat.to_script().to_yaml().unwrap();
    assert!(!yaml.contains("__origin__"));
    assert!(!yaml.contains("extends"));
}

#[test]
fn test_missing_parent_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let main = write_script(dir.path(), "main.yaml", "extends: ghost\nsteps: []\n");
    let err = ScriptResolver::new().resolve_file(&main).unwrap_err();
    assert!(matches!(err, ScriptError::ParentNotFound { reference, .. } if reference == "ghost"));
}

#[test]
fn test_inheritance_cycle_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "a.yaml", "extends: b\nsteps: []\n");
    let b = write_script(dir.path(), "b.yaml", "extends: a\nsteps: []\n");
    let err = ScriptResolver::new().resolve_file(&b).unwrap_err();
    assert!(matches!(err, ScriptError::Cycle(_)));
}

#[test]
fn test_lookup_prefers_base_then_conventional_dirs() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("scripts")).unwrap();
    std::fs::create_dir(dir.path().join("lib")).unwrap();
    write_script(&dir.path().join("lib"), "shared.yml", "steps: []\n");
    write_script(&dir.path().join("scripts"), "login.yaml", "steps: []\n");
    write_script(dir.path(), "login.yaml", "steps: []\n");

    let resolver = ScriptResolver::new();
    assert_eq!(
        resolver.find_script("login", dir.path()).unwrap(),
        dir.path().join("login.yaml")
    );
    assert_eq!(
        resolver.find_script("shared", dir.path()).unwrap(),
        dir.path().join("lib/shared.yml")
    );
    assert!(resolver.find_script("absent", dir.path()).is_none());

    let extra = tempfile::tempdir().unwrap();
    write_script(extra.path(), "remote.yaml", "steps: []\n");
    let with_extra = ScriptResolver::with_search_dirs(vec![extra.path().to_path_buf()]);
    assert!(with_extra.find_script("remote", dir.path()).is_some());
}
