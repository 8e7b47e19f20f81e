//! Top-level run loop: setup, main steps with reload checks, teardown.

use crate::actions::ActionRegistry;
use crate::artifacts::ErrorRecord;
use crate::config::{ConfigOverrides, RunnerConfig};
use crate::context::{ExecutionContext, Phase};
use crate::control::{ControlChannel, OperatorCommand};
use crate::errors::{RunError, StepError};
use crate::event_bus;
use crate::executor::Executor;
use crate::reload::{reconcile, ReloadCoordinator};
use crate::repair::{HeuristicRepair, RepairStrategy};
use crate::resolver::{FlatScript, ScriptResolver};
use crate::script::Script;
use crate::snapshot::Snapshot;
use crate::step::Step;
use reel::Backend;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
    Quit,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub name: Option<String>,
    pub steps_total: usize,
    pub steps_executed: usize,
    pub repairs: usize,
    pub reloads: usize,
    /// Set when a step exhausted its attempts
    pub failure: Option<ErrorRecord>,
    pub final_snapshot: Option<Snapshot>,
    pub vars: Map<String, Value>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status != RunStatus::Failed
    }
}

/// Runs one script against one backend session.
pub struct ScriptRunner {
    backend: Arc<dyn Backend>,
    config: RunnerConfig,
    overrides: ConfigOverrides,
    registry: ActionRegistry,
    repair: Arc<dyn RepairStrategy>,
    controls: Option<ControlChannel>,
    vars: Map<String, Value>,
    start_at: usize,
}

impl ScriptRunner {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            config: RunnerConfig::default(),
            overrides: ConfigOverrides::default(),
            registry: ActionRegistry::new(),
            repair: Arc::new(HeuristicRepair),
            controls: None,
            vars: Map::new(),
            start_at: 0,
        }
    }

    /// Base settings. The script's `config.runner` block is layered on top.
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
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
        self.controls = Some(controls);
        self
    }

    pub fn with_vars(mut self, vars: Map<String, Value>) -> Self {
        self.vars = vars;
        self
    }

    /// Skip the first `index` main steps.
    pub fn start_at(mut self, index: usize) -> Self {
        self.start_at = index;
        self
    }

    pub async fn run_file(self, path: &Path) -> Result<RunReport, RunError> {
        let resolver = ScriptResolver::with_search_dirs(self.config.script_dirs.clone());
        let flat = resolver.resolve_file(path)?;
        self.execute(flat, Some(path.to_path_buf())).await
    }

    /// Run an in-memory script. References resolve against `base_dir`; there is
    /// no source to reload from.
    pub async fn run_script(self, script: &Script, base_dir: &Path) -> Result<RunReport, RunError> {
        let resolver = ScriptResolver::with_search_dirs(self.config.script_dirs.clone());
        let flat = resolver.resolve(script, base_dir)?;
        self.execute(flat, None).await
    }

    async fn execute(self, mut flat: FlatScript, entry: Option<PathBuf>) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let config = self.overrides.apply(self.config.overlay(&flat.config)?);
        let resolver = ScriptResolver::with_search_dirs(config.script_dirs.clone());

        let mut executor = Executor::new(self.backend.clone(), config.clone())
            .with_registry(self.registry)
            .with_repair_strategy(self.repair)
            .with_controls(self.controls.unwrap_or_else(ControlChannel::detached))
            .with_base_dir(flat.base_dir.clone());
        let mut ctx = ExecutionContext::new(config.history_len).with_vars(self.vars);
        let mut reload = ReloadCoordinator::new(&flat.sources);

        let name = flat.name.clone();
        info!(
            "Running script '{}' as run {} ({} setup, {} steps, {} teardown)",
            name.as_deref().unwrap_or("unnamed"),
            run_id,
            flat.setup.len(),
            flat.steps.len(),
            flat.teardown.len()
        );
        event_bus::emit(
            "run.started",
            json!({"run_id": run_id, "name": name, "steps": flat.steps.len(), "sources": flat.sources}),
        );

        let mut status = RunStatus::Completed;
        let mut executed = 0usize;
        let mut reloads = 0usize;

        ctx.phase = Phase::Setup;
        let mut setup = std::mem::take(&mut flat.setup);
        for (index, step) in setup.iter_mut().enumerate() {
            ctx.step_index = index;
            match executor.execute_with_repair(step, &mut ctx).await {
                Ok(()) | Err(StepError::Skipped) => {}
                Err(StepError::Quit) => {
                    status = RunStatus::Quit;
                    break;
                }
                Err(e) => {
                    error!("Setup failed: {}", e);
                    status = RunStatus::Failed;
                    break;
                }
            }
        }

        if status == RunStatus::Completed {
            ctx.phase = Phase::Steps;
            let mut index = self.start_at;
            if index > 0 {
                info!("Skipping first {} steps, starting from index {}", index, index);
            }
            let mut skip_next = false;

            while index < flat.steps.len() {
                for command in executor.controls.drain() {
                    match command {
                        OperatorCommand::Reload => reload.request(),
                        OperatorCommand::Skip => skip_next = true,
                        OperatorCommand::Quit | OperatorCommand::Continue => {}
                    }
                }
                if std::mem::take(&mut executor.reload_requested) {
                    reload.request();
                }
                if executor.quit_active() {
                    info!("Quit requested before step {}", index);
                    status = RunStatus::Quit;
                    break;
                }
                for path in executor.written_sources.drain(..) {
                    reload.acknowledge(&path);
                }

                if reload.should_reload() {
                    if let Some(fresh) = reload_script(&resolver, entry.as_deref()) {
                        flat.steps = reconcile(&flat.steps, index, fresh.steps);
                        reload.rebaseline(&fresh.sources);
                        reloads += 1;
                        info!(
                            "Reloaded script; {} steps, resuming at {}",
                            flat.steps.len(),
                            index
                        );
                        event_bus::emit(
                            "run.reloaded",
                            json!({"index": index, "steps": flat.steps.len()}),
                        );
                        if index >= flat.steps.len() {
                            break;
                        }
                    }
                }

                if std::mem::take(&mut skip_next) {
                    info!("Step {} skipped by operator", index);
                    index += 1;
                    continue;
                }

                ctx.step_index = index;
                match executor.execute_with_repair(&mut flat.steps[index], &mut ctx).await {
                    Ok(()) => executed += 1,
                    Err(StepError::Skipped) => info!("Step {} skipped", index),
                    Err(StepError::Quit) => {
                        info!("Run stopped by operator at step {}", index);
                        status = RunStatus::Quit;
                        break;
                    }
                    Err(e) => {
                        error!("Step {} failed after all attempts: {}", index, e);
                        status = RunStatus::Failed;
                        break;
                    }
                }
                for path in executor.written_sources.drain(..) {
                    reload.acknowledge(&path);
                }
                index += 1;
            }
        }

        run_teardown(&mut executor, &mut flat.teardown, &mut ctx).await;

        let report = RunReport {
            run_id,
            status,
            name,
            steps_total: flat.steps.len(),
            steps_executed: executed,
            repairs: executor.repairs(),
            reloads,
            failure: match status {
                RunStatus::Failed => executor.last_error.clone(),
                _ => None,
            },
            final_snapshot: ctx.last_snapshot.clone(),
            vars: ctx.vars.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        executor.artifacts.write_report(&report);
        info!(
            "Run finished: status={:?} executed={} repairs={} reloads={}",
            report.status, report.steps_executed, report.repairs, report.reloads
        );
        event_bus::emit(
            "run.completed",
            json!({
                "run_id": report.run_id,
                "status": report.status,
                "executed": executed,
                "repairs": report.repairs
            }),
        );
        Ok(report)
    }
}

fn reload_script(resolver: &ScriptResolver, entry: Option<&Path>) -> Option<FlatScript> {
    let Some(path) = entry else {
        warn!("Reload requested but the script has no source file");
        return None;
    };
    match resolver.resolve_file(path) {
        Ok(fresh) => Some(fresh),
        Err(e) => {
            warn!("Reload failed, continuing with loaded steps: {}", e);
            None
        }
    }
}

/// Teardown always runs, even after a failure or quit. Its failures are logged.
async fn run_teardown(executor: &mut Executor, teardown: &mut [Step], ctx: &mut ExecutionContext) {
    if teardown.is_empty() {
        return;
    }
    info!("Running teardown ({} steps)", teardown.len());
    executor.begin_finalizing();
    ctx.phase = Phase::Teardown;
    for (index, step) in teardown.iter_mut().enumerate() {
        ctx.step_index = index;
        if let Err(e) = executor.execute_with_repair(step, ctx).await {
            warn!("Teardown step {} failed: {}", index, e);
        }
    }
    executor.end_finalizing();
}
