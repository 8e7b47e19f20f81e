//! The self-healing retry loop around each top-level step.
//!
//! Attempt, and on failure: classify, ask the repair strategy for a fix, persist
//! and apply it, roll the surface back to the pre-step snapshot, then try again.
//! Variables are restored to their pre-attempt values before each retry.

use crate::artifacts::{ErrorRecord, StepRecord};
use crate::context::{ExecutionContext, StepOutcome, StepStatus};
use crate::errors::{StepError, StepFailure};
use crate::event_bus;
use crate::executor::Executor;
use crate::repair::{classify, ErrorKind, FixResult, RepairContext};
use crate::script::patch_step;
use crate::snapshot::{ChangeSet, Snapshot};
use crate::step::{Step, StepKind};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

impl Executor {
    /// Run `step` with repairs. Exhausting `max_attempts` returns the last error.
    /// A fixed step is replaced in place, so callers keep the repaired version.
    pub async fn execute_with_repair(
        &mut self,
        step: &mut Step,
        ctx: &mut ExecutionContext,
    ) -> Result<(), StepError> {
        let max_attempts = self.config.max_attempts.max(1);
        let index = ctx.step_index;
        let mut repaired = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let vars_before = ctx.vars.clone();
            let before = match step.kind {
                StepKind::Assign(_) => None,
                _ => Some(Snapshot::capture(self.backend.as_ref()).await),
            };

            info!(
                "Step {} BEGIN action='{}' attempt={}/{}",
                index,
                step.action_name(),
                attempt,
                max_attempts
            );
            event_bus::emit(
                "step.started",
                json!({"index": index, "action": step.action_name(), "attempt": attempt}),
            );

            let (failure, failed_step) = match self.execute_step(step, ctx).await {
                Ok(()) => {
                    self.finish_step(step, ctx, repaired, before.as_ref());
                    return Ok(());
                }
                Err(StepError::Failed { failure, step }) => (failure, *step),
                Err(other) => return Err(other),
            };

            let kind = classify(&failure);
            warn!(
                "Step {} FAILED action='{}' kind={} attempt={}/{}: {}",
                index,
                failed_step.action_name(),
                kind,
                attempt,
                max_attempts,
                failure
            );

            let inventory = self.inventory().await;
            let record = ErrorRecord {
                phase: ctx.phase,
                kind,
                message: failure.to_string(),
                step_index: index,
                attempt,
                action: failed_step.action_name(),
                snapshot: before.clone().or_else(|| ctx.last_snapshot.clone()),
                inventory: inventory.clone(),
                history: ctx.history(),
                recorded_at: Utc::now(),
            };
            self.artifacts.record_error(&record);
            event_bus::emit(
                "step.failed",
                json!({
                    "index": index,
                    "action": record.action,
                    "kind": kind,
                    "attempt": attempt,
                    "message": record.message,
                }),
            );
            self.last_error = Some(record);

            if attempt >= max_attempts {
                ctx.record_outcome(outcome(index, &failed_step, StepStatus::Failed, Some(&failure)));
                return Err(StepError::Failed {
                    failure,
                    step: Box::new(failed_step),
                });
            }

            let repair_ctx = RepairContext {
                snapshot: before.clone().or_else(|| ctx.last_snapshot.clone()),
                inventory,
                history: ctx.history(),
                step_index: index,
                default_timeout: self.config.action_timeout,
            };
            let fix = self
                .repair
                .repair(kind, &failure, &failed_step.raw, &repair_ctx);

            let applied = match fix.patched.clone() {
                Some(patched) if fix.applied => self.apply_fix(step, &failed_step, patched, &fix),
                _ => false,
            };
            if applied {
                repaired = true;
            } else if kind == ErrorKind::UnknownAction {
                warn!(
                    "Skipping step {}: no fix for unknown action '{}' ({})",
                    index,
                    failed_step.action_name(),
                    fix.message
                );
                ctx.record_outcome(outcome(
                    index,
                    &failed_step,
                    StepStatus::Skipped,
                    Some(&failure),
                ));
                return Ok(());
            } else {
                debug!("No fix for step {}: {}", index, fix.message);
            }

            // A retry re-runs the whole step, so assignments it made are undone too.
            ctx.vars = vars_before;
            if let Some(before) = &before {
                self.rollback(before).await;
            }
        }
    }

    /// Swap the fix into the step tree and write it back to its source file.
    ///
    /// Steps of a sub-script called by name are not in the tree; they are read
    /// from disk on every call, so persisting the fix is what applies it.
    fn apply_fix(&mut self, step: &mut Step, failed: &Step, patched: Value, fix: &FixResult) -> bool {
        let in_tree = match step.replace_descendant(failed, patched.clone()) {
            Ok(found) => found,
            Err(e) => {
                warn!("Discarding repair that does not parse: {}", e);
                return false;
            }
        };

        let persisted = match (&failed.origin, self.config.persist_repairs) {
            (Some(origin), true) => match patch_step(origin, &patched) {
                Ok(path) => {
                    self.written_sources.push(path);
                    true
                }
                Err(e) => {
                    warn!("Could not persist repair: {}", e);
                    false
                }
            },
            _ => false,
        };

        if !in_tree && !persisted {
            warn!(
                "Repair for step '{}' cannot take effect: it is not in the step tree and was not written back",
                failed.action_name()
            );
            return false;
        }

        self.repairs += 1;
        info!("Repaired step '{}': {}", failed.action_name(), fix.message);
        event_bus::emit(
            "step.repaired",
            json!({
                "action": failed.action_name(),
                "message": fix.message,
                "kind": fix.kind,
                "patched": patched,
                "source": failed.origin.as_ref().map(|o| o.path.display().to_string()),
            }),
        );
        true
    }

    fn finish_step(
        &mut self,
        step: &Step,
        ctx: &mut ExecutionContext,
        repaired: bool,
        before: Option<&Snapshot>,
    ) {
        let index = ctx.step_index;
        let status = if repaired {
            StepStatus::Repaired
        } else {
            StepStatus::Success
        };
        let changes = step_changes(step, before, ctx.last_snapshot.as_ref());
        info!(
            "Step {} END action='{}' status={:?} changed={:?}",
            index,
            step.action_name(),
            status,
            changes.keys().collect::<Vec<_>>()
        );
        ctx.record_outcome(outcome(index, step, status, None));
        event_bus::emit(
            "step.completed",
            json!({
                "index": index,
                "phase": ctx.phase,
                "action": step.action_name(),
                "repaired": repaired,
                "changes": changes,
            }),
        );
        self.artifacts.record_step(&StepRecord {
            phase: ctx.phase,
            index,
            action: step.action_name(),
            step: step.raw.clone(),
            location: ctx
                .last_snapshot
                .as_ref()
                .map(|s| s.location.clone())
                .unwrap_or_default(),
            changes,
            vars: ctx.vars.clone(),
            recorded_at: Utc::now(),
        });
    }

    /// Drive the surface back to `snapshot`. Failures are logged only.
    pub async fn rollback(&self, snapshot: &Snapshot) {
        let limit = self.config.action_timeout;
        let backend = self.backend.as_ref();

        match backend.current_location().await {
            Ok(location) if !snapshot.location.is_empty() && location != snapshot.location => {
                info!("Rolling back location {} -> {}", location, snapshot.location);
                match tokio::time::timeout(limit, backend.navigate(&snapshot.location)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Rollback navigation failed: {}", e),
                    Err(_) => warn!("Rollback navigation timed out"),
                }
            }
            Ok(_) => {}
            Err(e) => debug!("Rollback could not read location: {}", e),
        }

        match tokio::time::timeout(limit, backend.scroll_to(snapshot.scroll)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Rollback scroll failed: {}", e),
            Err(_) => warn!("Rollback scroll timed out"),
        }
        if let Ok(Err(e)) = tokio::time::timeout(limit, backend.move_cursor(snapshot.cursor)).await {
            debug!("Rollback cursor move failed: {}", e);
        }
    }
}

/// Differences between the pre-step snapshot and one taken after it. Empty when
/// the step took no snapshot of its own.
fn step_changes(step: &Step, before: Option<&Snapshot>, after: Option<&Snapshot>) -> ChangeSet {
    let (Some(before), Some(after)) = (before, after) else {
        return ChangeSet::new();
    };
    if after.captured_at < before.captured_at {
        return ChangeSet::new();
    }
    let changes = before.diff(after);
    if changes.is_empty() && matches!(step.kind, StepKind::Action { .. }) {
        warn!(
            "Step {} action='{}' left the surface unchanged",
            after.step_index.unwrap_or_default(),
            step.action_name()
        );
    } else if before.is_equivalent(after) {
        debug!("Step '{}' moved the view but not the content", step.action_name());
    }
    changes
}

fn outcome(index: usize, step: &Step, status: StepStatus, failure: Option<&StepFailure>) -> StepOutcome {
    StepOutcome {
        index,
        action: step.action_name(),
        status,
        message: failure.map(ToString::to_string),
    }
}
