//! The step interpreter.
//!
//! Control-flow steps recurse into `execute_step` through boxed futures; there is
//! only ever one step touching the backend at a time. Every backend call is
//! bounded by the step timeout and abandoned as soon as the operator quits.

use crate::actions::{self, optional_duration, optional_number, optional_text, require_duration, require_text, ActionRegistry};
use crate::artifacts::{ArtifactStore, ErrorRecord};
use crate::config::RunnerConfig;
use crate::context::ExecutionContext;
use crate::control::{ControlChannel, OperatorCommand};
use crate::errors::{StepError, StepFailure};
use crate::event_bus;
use crate::expression_eval::{evaluate, evaluate_value, is_truthy, strip_delimiters};
use crate::helpers::{assignment_value, substitute_variables, wait_for_surface_ready};
use crate::repair::{classify, HeuristicRepair, RepairStrategy};
use crate::resolver::ScriptResolver;
use crate::snapshot::Snapshot;
use crate::step::{LoopBinding, Step, StepKind};
use futures::future::BoxFuture;
use futures::FutureExt;
use reel::{AutomationError, Backend, ElementInfo, PageOperation, Point};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct Executor {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) config: RunnerConfig,
    pub(crate) registry: ActionRegistry,
    pub(crate) resolver: ScriptResolver,
    pub(crate) base_dir: PathBuf,
    pub(crate) controls: ControlChannel,
    pub(crate) repair: Arc<dyn RepairStrategy>,
    pub(crate) artifacts: ArtifactStore,
    pub(crate) repairs: usize,
    /// Script files rewritten by repairs since the run loop last looked
    pub(crate) written_sources: Vec<PathBuf>,
    pub(crate) reload_requested: bool,
    pub(crate) last_error: Option<ErrorRecord>,
    /// Nonzero while `finally` blocks or teardown run after a quit
    finalizing: usize,
}

impl Executor {
    pub fn new(backend: Arc<dyn Backend>, config: RunnerConfig) -> Self {
        Self {
            backend,
            registry: ActionRegistry::new(),
            resolver: ScriptResolver::with_search_dirs(config.script_dirs.clone()),
            base_dir: PathBuf::from("."),
            controls: ControlChannel::detached(),
            repair: Arc::new(HeuristicRepair),
            artifacts: ArtifactStore::new(config.artifacts_dir.clone()),
            config,
            repairs: 0,
            written_sources: Vec::new(),
            reload_requested: false,
            last_error: None,
            finalizing: 0,
        }
    }

    pub fn with_registry(mut self, registry: ActionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_repair_strategy(mut self, repair: Arc<dyn RepairStrategy>) -> Self {
        self.repair = repair;
        self
    }

    pub fn with_controls(mut self, controls: ControlChannel) -> Self {
        self.controls = controls;
        self
    }

    /// Directory sub-scripts and runtime compositions are looked up from.
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub fn repairs(&self) -> usize {
        self.repairs
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub(crate) fn quit_active(&self) -> bool {
        self.finalizing == 0 && self.controls.quit_requested()
    }

    /// Run cleanup work even though a quit is pending.
    pub(crate) fn begin_finalizing(&mut self) {
        self.finalizing += 1;
    }

    pub(crate) fn end_finalizing(&mut self) {
        self.finalizing = self.finalizing.saturating_sub(1);
    }

    /// Execute one step and everything nested in it.
    pub fn execute_step<'a>(
        &'a mut self,
        step: &'a Step,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<(), StepError>> {
        async move {
            if self.quit_active() {
                return Err(StepError::Quit);
            }
            ctx.step_counter += 1;

            let Some(marker) = &step.compose else {
                return self.dispatch(step, ctx).await;
            };
            let mut params = Value::Object(marker.params.clone());
            substitute_variables(&mut params, &ctx.scope());
            let previous = ctx.push_params(into_map(params));
            let result = self.dispatch(step, ctx).await;
            ctx.restore_params(previous);
            result
        }
        .boxed()
    }

    async fn run_body(&mut self, steps: &[Step], ctx: &mut ExecutionContext) -> Result<(), StepError> {
        for step in steps {
            self.execute_step(step, ctx).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, step: &Step, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        debug!("Executing {} (step {})", step.action_name(), ctx.step_index);
        match &step.kind {
            StepKind::Sequence(body) => self.run_body(body, ctx).await,
            StepKind::Compose { target, params } => {
                self.run_composition(step, target, params, ctx).await
            }
            StepKind::Loop {
                binding,
                iterable,
                body,
            } => self.run_loop(binding, iterable, body, ctx).await,
            StepKind::Conditional {
                branches,
                otherwise,
            } => {
                for branch in branches {
                    if evaluate(&branch.condition, &ctx.scope()) {
                        return self.run_body(&branch.steps, ctx).await;
                    }
                }
                self.run_body(otherwise, ctx).await
            }
            StepKind::Assign(assignments) => {
                for assignment in assignments {
                    let value = assignment_value(&assignment.value, &ctx.scope());
                    debug!("set {} = {}", assignment.name, value);
                    ctx.set_var(assignment.name.clone(), value);
                }
                Ok(())
            }
            StepKind::Try {
                body,
                catch,
                finally,
            } => self.run_try(body, catch, finally, ctx).await,
            StepKind::Operation(operation) => {
                let started = Instant::now();
                self.delay(step).await?;
                let backend = self.backend.clone();
                self.guarded(step, operation.name(), backend.perform(*operation))
                    .await?;
                self.settle(step, started, true, ctx).await
            }
            StepKind::Action { name, args } => self.run_action(step, name, args, ctx).await,
        }
    }

    async fn run_loop(
        &mut self,
        binding: &LoopBinding,
        iterable: &str,
        body: &[Step],
        ctx: &mut ExecutionContext,
    ) -> Result<(), StepError> {
        let expression = strip_delimiters(iterable).unwrap_or(iterable);
        let items = match evaluate_value(expression, &ctx.scope()) {
            Ok(value) => loop_items(binding, value),
            Err(e) => {
                warn!("Could not evaluate loop iterable '{}': {}. Skipping loop.", iterable, e);
                Vec::new()
            }
        };
        debug!("Looping over {} items of '{}'", items.len(), iterable);

        for bindings in items {
            let shadowed = ctx.bind(bindings);
            let result = self.run_body(body, ctx).await;
            ctx.restore(shadowed);
            result?;
        }
        Ok(())
    }

    async fn run_try(
        &mut self,
        body: &[Step],
        catch: &[Step],
        finally: &[Step],
        ctx: &mut ExecutionContext,
    ) -> Result<(), StepError> {
        let outcome = match self.run_body(body, ctx).await {
            Err(StepError::Failed { failure, step }) => {
                warn!(
                    "try block failed at '{}': {}",
                    step.action_name(),
                    failure
                );
                ctx.set_var("__error__", json!(failure.to_string()));
                ctx.set_var("__error_type__", json!(classify(&failure).as_str()));
                self.run_body(catch, ctx).await
            }
            other => other,
        };

        if !finally.is_empty() {
            let quitting = matches!(outcome, Err(StepError::Quit));
            if quitting {
                self.begin_finalizing();
            }
            let cleanup = self.run_body(finally, ctx).await;
            if quitting {
                self.end_finalizing();
            }
            match cleanup {
                Ok(()) => {}
                Err(StepError::Quit) => return Err(StepError::Quit),
                Err(e) => warn!("finally block failed: {}", e),
            }
        }
        outcome
    }

    async fn run_composition(
        &mut self,
        step: &Step,
        target: &str,
        params: &Map<String, Value>,
        ctx: &mut ExecutionContext,
    ) -> Result<(), StepError> {
        let Some(path) = self.resolver.find_script(target, &self.base_dir) else {
            return Err(StepError::failed(
                step,
                StepFailure::UnknownAction(target.to_string()),
            ));
        };
        let mut params = Value::Object(params.clone());
        substitute_variables(&mut params, &ctx.scope());
        self.run_sub_script(step, target, &path, into_map(params), ctx)
            .await
    }

    async fn run_sub_script(
        &mut self,
        step: &Step,
        name: &str,
        path: &Path,
        params: Map<String, Value>,
        ctx: &mut ExecutionContext,
    ) -> Result<(), StepError> {
        let flat = self.resolver.resolve_file(path).map_err(|e| {
            StepError::failed(
                step,
                StepFailure::SubScript {
                    target: name.to_string(),
                    message: e.to_string(),
                },
            )
        })?;
        info!(
            "Running sub-script '{}' ({} steps) from {}",
            name,
            flat.steps.len(),
            path.display()
        );
        let previous = ctx.push_params(params);
        let result = self.run_body(&flat.steps, ctx).await;
        ctx.restore_params(previous);
        result
    }

    async fn run_action(
        &mut self,
        step: &Step,
        name: &str,
        raw_args: &Map<String, Value>,
        ctx: &mut ExecutionContext,
    ) -> Result<(), StepError> {
        let mut substituted = Value::Object(raw_args.clone());
        substitute_variables(&mut substituted, &ctx.scope());
        let args = into_map(substituted);

        if actions::is_known(name) {
            for field in actions::required_fields(name) {
                if matches!(args.get(*field), None | Some(Value::Null)) {
                    return Err(StepError::failed(
                        step,
                        StepFailure::MissingField {
                            action: name.to_string(),
                            field: field.to_string(),
                        },
                    ));
                }
            }
        }

        let started = Instant::now();
        self.delay(step).await?;

        let touched_backend = if actions::is_builtin(name) {
            self.run_builtin(step, name, raw_args, &args, ctx).await?
        } else if actions::is_native(name) {
            self.run_native(step, name, raw_args, &args, ctx).await?
        } else if let Some(path) = self.sub_script_for(name) {
            return self.run_sub_script(step, name, &path, args, ctx).await;
        } else if let Some(handler) = self.registry.get(name) {
            let backend = self.backend.clone();
            let value = self
                .guarded(step, name, handler.call(backend.as_ref(), &args))
                .await?;
            store_result(&args, value, ctx);
            true
        } else {
            return Err(StepError::failed(
                step,
                StepFailure::UnknownAction(name.to_string()),
            ));
        };

        self.settle(step, started, touched_backend, ctx).await
    }

    fn sub_script_for(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || self.registry.contains(name) {
            return None;
        }
        self.resolver.find_script(name, &self.base_dir)
    }

    /// Built-in actions. Returns whether the backend was driven.
    async fn run_builtin(
        &mut self,
        step: &Step,
        name: &str,
        raw_args: &Map<String, Value>,
        args: &Map<String, Value>,
        ctx: &mut ExecutionContext,
    ) -> Result<bool, StepError> {
        let failed = |failure: StepFailure| StepError::failed(step, failure);
        let backend = self.backend.clone();

        match name {
            "click" => {
                let target = require_text(args, name, "target").map_err(failed)?;
                self.guarded(step, "click", backend.click(&target)).await?;
            }
            "hover" => {
                let target = require_text(args, name, "target").map_err(failed)?;
                self.guarded(step, "hover", backend.hover(&target)).await?;
            }
            "type" => {
                let target = require_text(args, name, "target").map_err(failed)?;
                let text = require_text(args, name, "text").map_err(failed)?;
                self.guarded(step, "type", backend.type_text(&target, &text))
                    .await?;
            }
            "navigate" => {
                let url = require_text(args, name, "url").map_err(failed)?;
                self.guarded(step, "navigate", backend.navigate(&url)).await?;
            }
            "screenshot" => {
                let shot = require_text(args, name, "name").map_err(failed)?;
                let location = self
                    .guarded(step, "screenshot", backend.screenshot(&shot))
                    .await?;
                info!("Screenshot '{}' saved to {}", shot, location);
                store_result(args, Some(json!(location)), ctx);
            }
            "scroll" => {
                let target = scroll_target(args, ctx).map_err(failed)?;
                match target {
                    ScrollTarget::Operation(op) => {
                        self.guarded(step, "scroll", backend.perform(op)).await?
                    }
                    ScrollTarget::Offset(point) => {
                        self.guarded(step, "scroll", backend.scroll_to(point)).await?
                    }
                }
            }
            "wait" => {
                let duration = require_duration(args, name, "duration").map_err(failed)?;
                debug!("Waiting {}ms", duration.as_millis());
                self.sleep(duration).await?;
                return Ok(false);
            }
            "say" => {
                let text = require_text(args, name, "text").map_err(failed)?;
                info!(target: "reel::say", "{}", text);
                event_bus::emit("say", json!({"text": text, "step": ctx.step_index}));
                return Ok(false);
            }
            "log" => {
                let message = optional_text(args, name, "message")
                    .map_err(failed)?
                    .unwrap_or_default();
                match optional_text(args, name, "level").map_err(failed)?.as_deref() {
                    Some("warn" | "warning") => warn!(target: "reel::log", "{}", message),
                    Some("debug") => debug!(target: "reel::log", "{}", message),
                    _ => info!(target: "reel::log", "{}", message),
                }
                return Ok(false);
            }
            "pause" => {
                let message = optional_text(args, name, "message")
                    .map_err(failed)?
                    .unwrap_or_default();
                let timeout = optional_duration(args, name, "timeout").map_err(failed)?;
                self.pause(ctx.step_index, &message, timeout).await?;
                return Ok(false);
            }
            "assert" => {
                if !condition_holds(raw_args, args, ctx) {
                    let message = optional_text(args, name, "message")
                        .ok()
                        .flatten()
                        .unwrap_or_else(|| condition_label(raw_args));
                    return Err(failed(StepFailure::AssertionFailed(message)));
                }
                return Ok(false);
            }
            other => return Err(failed(StepFailure::UnknownAction(other.to_string()))),
        }
        Ok(true)
    }

    /// Wait for an operator command. Continue, timeout or a missing operator resume.
    async fn pause(
        &mut self,
        index: usize,
        message: &str,
        timeout: Option<Duration>,
    ) -> Result<(), StepError> {
        info!("Paused at step {}: {}", index, message);
        event_bus::emit("run.paused", json!({"step": index, "message": message}));
        match self.controls.wait(timeout).await {
            Some(OperatorCommand::Skip) => Err(StepError::Skipped),
            Some(OperatorCommand::Quit) => Err(StepError::Quit),
            Some(OperatorCommand::Reload) => {
                self.reload_requested = true;
                Ok(())
            }
            Some(OperatorCommand::Continue) | None => Ok(()),
        }
    }

    /// Actions that need their own polling or inspection. Returns whether the
    /// settle phase should capture a snapshot.
    async fn run_native(
        &mut self,
        step: &Step,
        name: &str,
        raw_args: &Map<String, Value>,
        args: &Map<String, Value>,
        ctx: &mut ExecutionContext,
    ) -> Result<bool, StepError> {
        let failed = |failure: StepFailure| StepError::failed(step, failure);
        let backend = self.backend.clone();

        match name {
            "evaluate" => {
                let code = require_text(args, name, "code").map_err(failed)?;
                let result = self.guarded(step, "evaluate", backend.evaluate(&code)).await?;
                store_result(args, Some(result), ctx);
                Ok(true)
            }
            "inspect" => {
                let store = optional_text(args, name, "store")
                    .map_err(failed)?
                    .unwrap_or_else(|| "inspection".to_string());
                let snapshot = Snapshot::capture(backend.as_ref())
                    .await
                    .tagged(ctx.step_index, name);
                let mut report = json!({"snapshot": snapshot.to_value()});
                if args.get("elements").is_some_and(is_truthy) {
                    report["elements"] = json!(self.inventory().await);
                }
                ctx.set_var(store, report);
                ctx.last_snapshot = Some(snapshot);
                Ok(false)
            }
            "wait_for" => {
                let limit = optional_duration(args, name, "timeout")
                    .map_err(failed)?
                    .or(step.options.timeout)
                    .unwrap_or(self.config.action_timeout);
                let code = optional_text(args, name, "code").map_err(failed)?;
                if code.is_none() && !raw_args.contains_key("condition") && !args.contains_key("location") {
                    return Err(failed(StepFailure::MissingField {
                        action: name.to_string(),
                        field: "condition".to_string(),
                    }));
                }
                let deadline = Instant::now() + limit;
                loop {
                    let snapshot = Snapshot::capture(backend.as_ref())
                        .await
                        .tagged(ctx.step_index, name);
                    ctx.last_snapshot = Some(snapshot);
                    let met = match code.as_deref() {
                        Some(code) if !raw_args.contains_key("condition") => self
                            .guarded(step, "wait_for", backend.evaluate(code))
                            .await
                            .map(|value| is_truthy(&value))?,
                        _ => condition_holds(raw_args, args, ctx),
                    };
                    if met {
                        return Ok(false);
                    }
                    if Instant::now() >= deadline {
                        return Err(failed(StepFailure::Backend(AutomationError::Timeout(
                            format!(
                                "condition '{}' not met within {}ms",
                                condition_label(raw_args),
                                limit.as_millis()
                            ),
                        ))));
                    }
                    self.sleep(self.config.ready_poll_interval).await?;
                }
            }
            "wait_ready" => {
                let limit = optional_duration(args, name, "timeout")
                    .map_err(failed)?
                    .unwrap_or(self.config.ready_timeout);
                if !wait_for_surface_ready(backend.as_ref(), limit, self.config.ready_poll_interval)
                    .await
                {
                    return Err(failed(StepFailure::Backend(AutomationError::Timeout(
                        format!("surface not ready within {}ms", limit.as_millis()),
                    ))));
                }
                Ok(true)
            }
            other => Err(failed(StepFailure::UnknownAction(other.to_string()))),
        }
    }

    /// Interactive elements for repair context, capped by the configured limit.
    pub(crate) async fn inventory(&self) -> Vec<ElementInfo> {
        let probe = tokio::time::timeout(
            self.config.action_timeout,
            self.backend.interactive_elements(),
        )
        .await;
        match probe {
            Ok(Ok(mut elements)) => {
                elements.truncate(self.config.inventory_limit);
                elements
            }
            Ok(Err(e)) => {
                debug!("Element inventory unavailable: {}", e);
                Vec::new()
            }
            Err(_) => {
                debug!("Element inventory timed out");
                Vec::new()
            }
        }
    }

    /// Run a backend call under the step timeout, abandoning it on quit.
    async fn guarded<T>(
        &self,
        step: &Step,
        what: &str,
        call: impl Future<Output = Result<T, AutomationError>>,
    ) -> Result<T, StepError> {
        let limit = step.options.timeout.unwrap_or(self.config.action_timeout);
        let quit = self.controls.quit_token();
        let watch_quit = self.finalizing == 0;
        tokio::select! {
            biased;
            _ = quit.cancelled(), if watch_quit => Err(StepError::Quit),
            result = tokio::time::timeout(limit, call) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(StepError::failed(step, e)),
                Err(_) => Err(StepError::failed(
                    step,
                    AutomationError::Timeout(format!(
                        "{what} exceeded {}ms",
                        limit.as_millis()
                    )),
                )),
            },
        }
    }

    async fn sleep(&self, duration: Duration) -> Result<(), StepError> {
        if duration.is_zero() {
            return Ok(());
        }
        if self.finalizing > 0 {
            tokio::time::sleep(duration).await;
            return Ok(());
        }
        let quit = self.controls.quit_token();
        tokio::select! {
            biased;
            _ = quit.cancelled() => Err(StepError::Quit),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn delay(&self, step: &Step) -> Result<(), StepError> {
        match step.options.pause_before {
            Some(pause) => {
                debug!("Pausing {}ms before {}", pause.as_millis(), step.action_name());
                self.sleep(pause).await
            }
            None => Ok(()),
        }
    }

    /// Post-action phase: wait for the surface, honour `static`, take a snapshot.
    async fn settle(
        &mut self,
        step: &Step,
        started: Instant,
        touched_backend: bool,
        ctx: &mut ExecutionContext,
    ) -> Result<(), StepError> {
        if touched_backend && step.options.wait {
            wait_for_surface_ready(
                self.backend.as_ref(),
                self.config.ready_timeout,
                self.config.ready_poll_interval,
            )
            .await;
        }
        if step.options.is_static {
            let remaining = self
                .config
                .static_min_duration
                .saturating_sub(started.elapsed());
            self.sleep(remaining).await?;
        }
        if touched_backend {
            let snapshot = Snapshot::capture(self.backend.as_ref())
                .await
                .tagged(ctx.step_index, step.action_name());
            ctx.last_snapshot = Some(snapshot);
        }
        Ok(())
    }
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Per-iteration variable bindings for a loop.
fn loop_items(binding: &LoopBinding, value: Value) -> Vec<Vec<(String, Value)>> {
    match (binding, value) {
        (LoopBinding::Single(name), Value::Array(items)) => items
            .into_iter()
            .map(|item| vec![(name.clone(), item)])
            .collect(),
        (LoopBinding::Pair(index, name), Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| vec![(index.clone(), json!(i)), (name.clone(), item)])
            .collect(),
        (LoopBinding::Single(name), Value::Object(map)) => map
            .into_iter()
            .map(|(key, value)| vec![(name.clone(), json!({"key": key, "value": value}))])
            .collect(),
        (LoopBinding::Pair(key_name, value_name), Value::Object(map)) => map
            .into_iter()
            .map(|(key, value)| vec![(key_name.clone(), json!(key)), (value_name.clone(), value)])
            .collect(),
        (_, Value::Null) => Vec::new(),
        (_, other) => {
            warn!("Loop iterable is not a list or mapping: {}", other);
            Vec::new()
        }
    }
}

fn store_result(args: &Map<String, Value>, value: Option<Value>, ctx: &mut ExecutionContext) {
    let (Some(name), Some(value)) = (args.get("store").and_then(Value::as_str), value) else {
        return;
    };
    ctx.set_var(name, value);
}

fn condition_label(raw_args: &Map<String, Value>) -> String {
    ["condition", "location", "code"]
        .iter()
        .find_map(|field| raw_args.get(*field))
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default()
}

/// Evaluate a step's condition against the current scope. The raw text is
/// re-evaluated so polling sees fresh state; a `location` fragment matches
/// the last snapshot's location.
fn condition_holds(
    raw_args: &Map<String, Value>,
    args: &Map<String, Value>,
    ctx: &ExecutionContext,
) -> bool {
    if let Some(condition) = raw_args.get("condition") {
        return match condition {
            Value::String(text) => evaluate(text, &ctx.scope()),
            other => is_truthy(other),
        };
    }
    if let Some(Value::String(fragment)) = args.get("location") {
        return ctx
            .last_snapshot
            .as_ref()
            .is_some_and(|s| s.location.contains(fragment.as_str()));
    }
    false
}

enum ScrollTarget {
    Operation(PageOperation),
    Offset(Point),
}

fn scroll_target(args: &Map<String, Value>, ctx: &ExecutionContext) -> Result<ScrollTarget, StepFailure> {
    let current = ctx
        .last_snapshot
        .as_ref()
        .map(|s| s.scroll)
        .unwrap_or_default();
    let coordinate = |map: &Map<String, Value>, field: &str, fallback: f64| {
        optional_number(map, "scroll", field).map(|n| n.unwrap_or(fallback))
    };

    match args.get("to") {
        Some(Value::String(to)) if to.eq_ignore_ascii_case("top") => {
            Ok(ScrollTarget::Operation(PageOperation::ScrollTop))
        }
        Some(Value::String(to)) if to.eq_ignore_ascii_case("bottom") => {
            Ok(ScrollTarget::Operation(PageOperation::ScrollBottom))
        }
        Some(Value::Number(y)) => Ok(ScrollTarget::Offset(Point::new(
            current.x,
            y.as_f64().unwrap_or(current.y),
        ))),
        Some(Value::Object(point)) => Ok(ScrollTarget::Offset(Point::new(
            coordinate(point, "x", current.x)?,
            coordinate(point, "y", current.y)?,
        ))),
        Some(other) => Err(StepFailure::TypeMismatch {
            action: "scroll".to_string(),
            field: "to".to_string(),
            expected: "top, bottom or coordinates",
            actual: other.to_string(),
        }),
        None if args.contains_key("x") || args.contains_key("y") => {
            Ok(ScrollTarget::Offset(Point::new(
                coordinate(args, "x", current.x)?,
                coordinate(args, "y", current.y)?,
            )))
        }
        None => Err(StepFailure::MissingField {
            action: "scroll".to_string(),
            field: "to".to_string(),
        }),
    }
}
