mod common;

use common::{fast_config, init_tracing, write_script};
use reel::SimulatedBackend;
use reel_runner::artifacts::{ArtifactStore, ERRORS_LOG, REPORT_FILE, STATE_FILE, STEPS_LOG};
use reel_runner::{
    control_channel, ConfigOverrides, NoRepair, OperatorCommand, Phase, RunStatus, Script,
    ScriptRunner,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn teardown_runs_after_failure() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let script = Script::from_yaml(
        r#"
setup:
  - set: {ready: true}
steps:
  - click: Missing
  - set: {after: true}
teardown:
  - set: {torn_down: true}
"#,
    )
    .unwrap();

    let report = ScriptRunner::new(Arc::new(SimulatedBackend::new().strict(true)))
        .with_config(fast_config())
        .with_repair_strategy(Arc::new(NoRepair))
        .run_script(&script, dir.path())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert!(!report.succeeded());
    assert_eq!(report.vars["ready"], json!(true));
    assert_eq!(report.vars["torn_down"], json!(true));
    assert!(!report.vars.contains_key("after"));
}

#[tokio::test]
async fn failing_setup_skips_the_main_steps() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::from_yaml(
        "setup:\n  - assert: \"1 == 2\"\nsteps:\n  - set: {main: true}\nteardown:\n  - set: {torn_down: true}\n",
    )
    .unwrap();
    let mut config = fast_config();
    config.max_attempts = 1;

    let report = ScriptRunner::new(Arc::new(SimulatedBackend::new()))
        .with_config(config)
        .run_script(&script, dir.path())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert!(!report.vars.contains_key("main"));
    assert_eq!(report.vars["torn_down"], json!(true));
}

#[tokio::test]
async fn quit_before_start_still_runs_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::from_yaml(
        "steps:\n  - set: {main: true}\nteardown:\n  - set: {torn_down: true}\n",
    )
    .unwrap();
    let (handle, controls) = control_channel();
    handle.quit();

    let report = ScriptRunner::new(Arc::new(SimulatedBackend::new()))
        .with_config(fast_config())
        .with_controls(controls)
        .run_script(&script, dir.path())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Quit);
    assert!(report.succeeded());
    assert!(!report.vars.contains_key("main"));
    assert_eq!(report.vars["torn_down"], json!(true));
}

#[tokio::test]
async fn quit_interrupts_a_pause() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::from_yaml(
        "steps:\n  - pause: {message: waiting for operator, timeout: 10s}\n  - set: {after: true}\n",
    )
    .unwrap();
    let (handle, controls) = control_channel();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.send(OperatorCommand::Quit);
    });

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        ScriptRunner::new(Arc::new(SimulatedBackend::new()))
            .with_config(fast_config())
            .with_controls(controls)
            .run_script(&script, dir.path()),
    )
    .await
    .expect("quit should end the pause")
    .unwrap();

    assert_eq!(report.status, RunStatus::Quit);
    assert!(!report.vars.contains_key("after"));
}

#[tokio::test]
async fn continue_resumes_a_pause() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::from_yaml(
        "steps:\n  - pause: {message: check the form}\n  - set: {after: true}\n",
    )
    .unwrap();
    let (handle, controls) = control_channel();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.send(OperatorCommand::Continue);
    });

    let report = ScriptRunner::new(Arc::new(SimulatedBackend::new()))
        .with_config(fast_config())
        .with_controls(controls)
        .run_script(&script, dir.path())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.vars["after"], json!(true));
}

#[tokio::test]
async fn quit_inside_try_still_runs_finally() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::from_yaml(
        r#"
steps:
  - try:
      - pause: {message: hold here, timeout: 10s}
      - set: {unreachable: true}
    finally:
      - set: {cleaned: true}
  - set: {after: true}
teardown:
  - set: {torn_down: true}
"#,
    )
    .unwrap();
    let (handle, controls) = control_channel();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.send(OperatorCommand::Quit);
    });

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        ScriptRunner::new(Arc::new(SimulatedBackend::new()))
            .with_config(fast_config())
            .with_controls(controls)
            .run_script(&script, dir.path()),
    )
    .await
    .expect("quit should end the pause")
    .unwrap();

    assert_eq!(report.status, RunStatus::Quit);
    assert_eq!(report.vars["cleaned"], json!(true));
    assert_eq!(report.vars["torn_down"], json!(true));
    assert!(!report.vars.contains_key("unreachable"));
    assert!(!report.vars.contains_key("after"));
}

#[tokio::test]
async fn operator_skip_skips_the_next_step() {
    let dir = tempfile::tempdir().unwrap();
    let script =
        Script::from_yaml("steps:\n  - set: {first: true}\n  - set: {second: true}\n").unwrap();
    let (handle, controls) = control_channel();
    handle.send(OperatorCommand::Skip);

    let report = ScriptRunner::new(Arc::new(SimulatedBackend::new()))
        .with_config(fast_config())
        .with_controls(controls)
        .run_script(&script, dir.path())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert!(!report.vars.contains_key("first"));
    assert_eq!(report.vars["second"], json!(true));
    assert_eq!(report.steps_executed, 1);
}

#[tokio::test]
async fn artifacts_record_steps_errors_and_report() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let artifacts = dir.path().join("artifacts");
    let path = write_script(
        dir.path(),
        "flow.yaml",
        "steps:\n  - navigate: https://a.test/\n  - click: Missing\n",
    );

    let report = ScriptRunner::new(Arc::new(SimulatedBackend::new().strict(true)))
        .with_config(fast_config())
        .with_overrides(ConfigOverrides {
            max_attempts: Some(2),
            artifacts_dir: Some(artifacts.clone()),
            ..ConfigOverrides::default()
        })
        .with_repair_strategy(Arc::new(NoRepair))
        .run_file(&path)
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Failed);

    let state = ArtifactStore::load_state(&artifacts).unwrap();
    assert_eq!(state.index, 0);
    assert_eq!(state.action, "navigate");
    assert_eq!(state.location, "https://a.test/");

    let steps = std::fs::read_to_string(artifacts.join(STEPS_LOG)).unwrap();
    assert_eq!(steps.lines().count(), 1);

    let errors = std::fs::read_to_string(artifacts.join(ERRORS_LOG)).unwrap();
    let records: Vec<Value> = errors
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["kind"], json!("element-not-found"));
    assert_eq!(records[1]["attempt"], json!(2));
    assert_eq!(records[1]["snapshot"]["location"], json!("https://a.test/"));

    let written: Value =
        serde_json::from_str(&std::fs::read_to_string(artifacts.join(REPORT_FILE)).unwrap())
            .unwrap();
    assert_eq!(written["status"], json!("failed"));
    assert_eq!(written["run_id"], json!(report.run_id));
    assert!(artifacts.join(STATE_FILE).exists());
}

#[tokio::test]
async fn state_names_the_last_main_step_after_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let artifacts = dir.path().join("artifacts");
    let script = Script::from_yaml(
        "steps:\n  - set: {a: 1}\n  - set: {b: 2}\n  - set: {c: 3}\n  - assert: \"1 == 2\"\nteardown:\n  - log: bye\n",
    )
    .unwrap();

    let report = ScriptRunner::new(Arc::new(SimulatedBackend::new()))
        .with_config(fast_config())
        .with_overrides(ConfigOverrides {
            max_attempts: Some(1),
            artifacts_dir: Some(artifacts.clone()),
            ..ConfigOverrides::default()
        })
        .run_script(&script, dir.path())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Failed);

    let state = ArtifactStore::load_state(&artifacts).unwrap();
    assert_eq!(state.phase, Phase::Steps);
    assert_eq!(state.index, 2);
    assert_eq!(state.action, "set");

    let steps = std::fs::read_to_string(artifacts.join(STEPS_LOG)).unwrap();
    let last: Value = serde_json::from_str(steps.lines().last().unwrap()).unwrap();
    assert_eq!(last["phase"], json!("teardown"));
    assert_eq!(last["action"], json!("log"));
}

#[tokio::test]
async fn step_records_carry_surface_changes() {
    let dir = tempfile::tempdir().unwrap();
    let artifacts = dir.path().join("artifacts");
    let script = Script::from_yaml("steps:\n  - navigate: https://a.test/\n  - log: done\n").unwrap();

    let report = ScriptRunner::new(Arc::new(SimulatedBackend::new()))
        .with_config(fast_config())
        .with_overrides(ConfigOverrides {
            artifacts_dir: Some(artifacts.clone()),
            ..ConfigOverrides::default()
        })
        .run_script(&script, dir.path())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    let steps = std::fs::read_to_string(artifacts.join(STEPS_LOG)).unwrap();
    let records: Vec<Value> = steps
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["changes"]["location"]["from"], json!("about:blank"));
    assert_eq!(records[0]["changes"]["location"]["to"], json!("https://a.test/"));
    assert!(records[1].get("changes").is_none());
}

#[tokio::test]
async fn start_at_skips_leading_steps() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::from_yaml(
        "steps:\n  - set: {one: 1}\n  - set: {two: 2}\n  - set: {three: 3}\n",
    )
    .unwrap();
    let mut vars = Map::new();
    vars.insert("seeded".to_string(), json!("yes"));

    let report = ScriptRunner::new(Arc::new(SimulatedBackend::new()))
        .with_config(fast_config())
        .with_vars(vars)
        .start_at(2)
        .run_script(&script, dir.path())
        .await
        .unwrap();

    assert_eq!(report.steps_executed, 1);
    assert!(!report.vars.contains_key("one"));
    assert_eq!(report.vars["three"], json!(3));
    assert_eq!(report.vars["seeded"], json!("yes"));
}

#[tokio::test]
async fn script_config_overrides_runner_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(SimulatedBackend::new().strict(true));
    let script = Script::from_yaml(
        "config:\n  runner:\n    max_attempts: 2\nsteps:\n  - click: Missing\n",
    )
    .unwrap();

    let report = ScriptRunner::new(backend.clone())
        .with_config(fast_config())
        .with_repair_strategy(Arc::new(NoRepair))
        .run_script(&script, dir.path())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(backend.calls_to("click").len(), 2);
}
