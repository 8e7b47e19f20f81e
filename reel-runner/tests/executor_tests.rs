mod common;

use async_trait::async_trait;
use common::{fast_config, init_tracing, write_script};
use reel::{AutomationError, Backend, ElementInfo, SimulatedBackend};
use reel_runner::{
    ActionHandler, ActionRegistry, ExecutionContext, Executor, RunReport, RunStatus, Script,
    ScriptRunner, Step,
};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

async fn run_yaml(backend: Arc<SimulatedBackend>, yaml: &str, base_dir: &Path) -> RunReport {
    init_tracing();
    let script = Script::from_yaml(yaml).unwrap();
    ScriptRunner::new(backend)
        .with_config(fast_config())
        .run_script(&script, base_dir)
        .await
        .unwrap()
}

#[tokio::test]
async fn loop_variables_do_not_leak() {
    let dir = tempfile::tempdir().unwrap();
    let report = run_yaml(
        Arc::new(SimulatedBackend::new()),
        r#"
steps:
  - set: {y: 0}
  - for: x in [1, 2, 3]
    steps:
      - set: "y = y + 1"
"#,
        dir.path(),
    )
    .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.vars["y"], json!(3));
    assert!(!report.vars.contains_key("x"));
}

#[tokio::test]
async fn loop_restores_shadowed_variables_and_binds_pairs() {
    let dir = tempfile::tempdir().unwrap();
    let report = run_yaml(
        Arc::new(SimulatedBackend::new()),
        r#"
steps:
  - set: {item: outer, seen: ""}
  - for: i, item in ['a', 'b']
    steps:
      - set: "seen = seen + str(i) + item"
  - for: missing in undefined_list
    steps:
      - set: {never: true}
"#,
        dir.path(),
    )
    .await;

    assert_eq!(report.vars["item"], json!("outer"));
    assert_eq!(report.vars["seen"], json!("0a1b"));
    assert!(!report.vars.contains_key("i"));
    assert!(!report.vars.contains_key("never"));
    assert_eq!(report.status, RunStatus::Completed);
}

#[tokio::test]
async fn accumulates_over_range() {
    let dir = tempfile::tempdir().unwrap();
    let report = run_yaml(
        Arc::new(SimulatedBackend::new()),
        r#"
steps:
  - set: {n: 0}
  - for: i in range(1, 4)
    steps:
      - set: "n = n + i"
"#,
        dir.path(),
    )
    .await;
    assert_eq!(report.vars["n"], json!(6));
}

#[tokio::test]
async fn only_the_first_true_branch_runs() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = |n: i64| {
        format!(
            r#"
steps:
  - set: {{n: {n}}}
  - if: "n > 3"
    then:
      - set: {{first: true}}
    elif:
      - if: "n > 1"
        then:
          - set: {{second: true}}
      - if: "n > 0"
        then:
          - set: {{third: true}}
    else:
      - set: {{fallback: true}}
"#
        )
    };

    let report = run_yaml(Arc::new(SimulatedBackend::new()), &yaml(5), dir.path()).await;
    assert_eq!(report.vars.get("first"), Some(&json!(true)));
    assert!(!report.vars.contains_key("second"));
    assert!(!report.vars.contains_key("third"));

    let report = run_yaml(Arc::new(SimulatedBackend::new()), &yaml(2), dir.path()).await;
    assert!(!report.vars.contains_key("first"));
    assert_eq!(report.vars.get("second"), Some(&json!(true)));
    assert!(!report.vars.contains_key("third"));

    let report = run_yaml(Arc::new(SimulatedBackend::new()), &yaml(-1), dir.path()).await;
    assert_eq!(report.vars.get("fallback"), Some(&json!(true)));
}

#[tokio::test]
async fn try_catch_finally_exposes_the_error() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(SimulatedBackend::new().strict(true));
    let report = run_yaml(
        backend,
        r#"
steps:
  - try:
      - click: Missing
      - set: {unreachable: true}
    catch:
      - set:
          kind: "{{ __error_type__ }}"
          message: "{{ __error__ }}"
    finally:
      - set: {cleaned: true}
  - set: {after: true}
"#,
        dir.path(),
    )
    .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.vars["kind"], json!("element-not-found"));
    assert!(report.vars["message"].as_str().unwrap().contains("Missing"));
    assert_eq!(report.vars["cleaned"], json!(true));
    assert_eq!(report.vars["after"], json!(true));
    assert!(!report.vars.contains_key("unreachable"));
}

#[tokio::test]
async fn set_distinguishes_literals_from_expressions() {
    let dir = tempfile::tempdir().unwrap();
    let report = run_yaml(
        Arc::new(SimulatedBackend::new()),
        r#"
steps:
  - set:
      greeting: hello world
      sum: "2 + 3"
      flag: "true"
      url: "https://example.test/{{ 40 + 2 }}"
  - set: "product = sum * 2"
"#,
        dir.path(),
    )
    .await;

    assert_eq!(report.vars["greeting"], json!("hello world"));
    assert_eq!(report.vars["sum"], json!(5));
    assert_eq!(report.vars["flag"], json!(true));
    assert_eq!(report.vars["url"], json!("https://example.test/42"));
    assert_eq!(report.vars["product"], json!(10));
}

#[tokio::test]
async fn unknown_action_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(SimulatedBackend::new());
    let report = run_yaml(
        backend.clone(),
        r#"
steps:
  - action: frobnicate
    target: Widget
  - set: {after: 1}
"#,
        dir.path(),
    )
    .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.vars["after"], json!(1));
    assert!(backend.calls_to("click").is_empty());
    assert_eq!(report.repairs, 0);
}

struct Lookup;

#[async_trait]
impl ActionHandler for Lookup {
    async fn call(
        &self,
        backend: &dyn Backend,
        args: &Map<String, Value>,
    ) -> Result<Option<Value>, AutomationError> {
        let location = backend.current_location().await?;
        let key = args
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| AutomationError::InvalidArgument("key".into()))?;
        Ok(Some(json!({"key": key, "location": location})))
    }
}

#[tokio::test]
async fn registered_actions_receive_substituted_args() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ActionRegistry::new();
    registry.register("lookup", Arc::new(Lookup));

    let script = Script::from_yaml(
        r#"
steps:
  - set: {id: abc}
  - action: lookup
    key: "{{ id }}"
    store: found
"#,
    )
    .unwrap();
    let report = ScriptRunner::new(Arc::new(
        SimulatedBackend::new().with_location("https://app.test/"),
    ))
    .with_config(fast_config())
    .with_registry(registry)
    .run_script(&script, dir.path())
    .await
    .unwrap();

    assert_eq!(
        report.vars["found"],
        json!({"key": "abc", "location": "https://app.test/"})
    );
}

#[tokio::test]
async fn page_operations_and_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(SimulatedBackend::new());
    let report = run_yaml(
        backend.clone(),
        r#"
steps:
  - navigate: https://a.test/
  - navigate: https://b.test/
  - go_back
  - scroll: {to: bottom}
  - wait_for:
      location: a.test
      timeout: 500ms
"#,
        dir.path(),
    )
    .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(backend.location(), "https://a.test/");
    let snapshot = report.final_snapshot.unwrap();
    assert_eq!(snapshot.location, "https://a.test/");
    assert!(snapshot.scroll.y > 0.0);
}

#[tokio::test]
async fn static_steps_take_the_minimum_duration() {
    let dir = tempfile::tempdir().unwrap();
    let started = Instant::now();
    let report = run_yaml(
        Arc::new(SimulatedBackend::new()),
        "steps:\n  - click: Save\n    static: true\n",
        dir.path(),
    )
    .await;
    assert_eq!(report.status, RunStatus::Completed);
    assert!(started.elapsed() >= fast_config().static_min_duration);
}

#[tokio::test]
async fn sub_script_runs_by_action_name() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        "login.yaml",
        "steps:\n  - type:\n      target: User\n      text: \"{{ user }}\"\n  - click: Sign in\n",
    );
    let backend = Arc::new(SimulatedBackend::new());
    let report = run_yaml(
        backend.clone(),
        "steps:\n  - action: login\n    user: ada\n  - compose: login\n    params: {user: bob}\n",
        dir.path(),
    )
    .await;

    assert_eq!(report.status, RunStatus::Completed);
    let typed: Vec<_> = backend
        .calls_to("type")
        .into_iter()
        .filter_map(|call| call.value)
        .collect();
    assert_eq!(typed, vec!["ada".to_string(), "bob".to_string()]);
    assert_eq!(backend.calls_to("click").len(), 2);
    assert!(!report.vars.contains_key("user"));
}

#[tokio::test]
async fn execute_step_drives_the_backend_directly() {
    init_tracing();
    let backend = Arc::new(
        SimulatedBackend::new()
            .strict(true)
            .with_elements(vec![ElementInfo::new("textbox", "Email")]),
    );
    let mut executor = Executor::new(backend.clone(), fast_config());
    let mut ctx = ExecutionContext::default();

    let step = Step::parse(json!({"type": {"target": "Email", "text": "a@b.c"}})).unwrap();
    executor.execute_step(&step, &mut ctx).await.unwrap();
    assert_eq!(backend.typed_value("Email").as_deref(), Some("a@b.c"));
    assert_eq!(
        ctx.last_snapshot.as_ref().and_then(|s| s.focused.clone()).as_deref(),
        Some("Email")
    );

    let missing = Step::parse(json!({"action": "type", "target": "Email"})).unwrap();
    let err = executor.execute_step(&missing, &mut ctx).await.unwrap_err();
    assert!(err.to_string().contains("text"));
}

#[tokio::test]
async fn assert_fails_the_step() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::from_yaml(
        "steps:\n  - set: {count: 1}\n  - assert: {condition: \"count > 1\", message: count too low}\n",
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
    let failure = report.failure.unwrap();
    assert_eq!(failure.step_index, 1);
    assert!(failure.message.contains("count too low"));
}
