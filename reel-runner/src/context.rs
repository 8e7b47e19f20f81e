use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
    Repaired,
}

/// Which list of the script a top-level step belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Setup,
    #[default]
    Steps,
    Teardown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    pub action: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Run-wide mutable scope, passed by `&mut` through every step.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub vars: Map<String, Value>,
    pub params: Map<String, Value>,
    pub last_snapshot: Option<Snapshot>,
    /// Steps attempted so far, nested ones included
    pub step_counter: usize,
    /// Index of the top-level step being executed, within `phase`
    pub step_index: usize,
    pub phase: Phase,
    history: VecDeque<StepOutcome>,
    history_limit: usize,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ExecutionContext {
    pub fn new(history_limit: usize) -> Self {
        Self {
            vars: Map::new(),
            params: Map::new(),
            last_snapshot: None,
            step_counter: 0,
            step_index: 0,
            phase: Phase::Steps,
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
        }
    }

    pub fn with_vars(mut self, vars: Map<String, Value>) -> Self {
        self.vars = vars;
        self
    }

    /// What expressions see: `vars` over `params`, plus the previous snapshot as `state`.
    pub fn scope(&self) -> Value {
        let mut scope = self.params.clone();
        for (key, value) in &self.vars {
            scope.insert(key.clone(), value.clone());
        }
        let state = self
            .last_snapshot
            .as_ref()
            .map(Snapshot::to_value)
            .unwrap_or(Value::Null);
        scope.insert("state".to_string(), state);
        Value::Object(scope)
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Bind loop variables, returning whatever they shadowed.
    pub fn bind(&mut self, bindings: Vec<(String, Value)>) -> Vec<(String, Option<Value>)> {
        bindings
            .into_iter()
            .map(|(name, value)| {
                let previous = self.vars.insert(name.clone(), value);
                (name, previous)
            })
            .collect()
    }

    /// Undo `bind`: remove the variables, restoring shadowed values.
    pub fn restore(&mut self, shadowed: Vec<(String, Option<Value>)>) {
        for (name, previous) in shadowed {
            match previous {
                Some(value) => {
                    self.vars.insert(name, value);
                }
                None => {
                    self.vars.remove(&name);
                }
            }
        }
    }

    /// Merge composition parameters, returning the previous set.
    pub fn push_params(&mut self, params: Map<String, Value>) -> Map<String, Value> {
        let previous = self.params.clone();
        self.params.extend(params);
        previous
    }

    pub fn restore_params(&mut self, previous: Map<String, Value>) {
        self.params = previous;
    }

    pub fn record_outcome(&mut self, outcome: StepOutcome) {
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(outcome);
    }

    /// Most recent outcomes, oldest first.
    pub fn history(&self) -> Vec<StepOutcome> {
        self.history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_prefers_vars() {
        let mut ctx = ExecutionContext::default();
        ctx.params.insert("user".into(), json!("param"));
        ctx.params.insert("only_param".into(), json!(1));
        ctx.set_var("user", json!("var"));
        let scope = ctx.scope();
        assert_eq!(scope["user"], "var");
        assert_eq!(scope["only_param"], 1);
        assert_eq!(scope["state"], Value::Null);
    }

    #[test]
    fn test_bind_restores_shadowed() {
        let mut ctx = ExecutionContext::default();
        ctx.set_var("x", json!("outer"));
        let shadowed = ctx.bind(vec![("x".into(), json!(1)), ("y".into(), json!(2))]);
        assert_eq!(ctx.var("x"), Some(&json!(1)));
        ctx.restore(shadowed);
        assert_eq!(ctx.var("x"), Some(&json!("outer")));
        assert!(ctx.var("y").is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut ctx = ExecutionContext::new(2);
        for index in 0..3 {
            ctx.record_outcome(StepOutcome {
                index,
                action: "click".into(),
                status: StepStatus::Success,
                message: None,
            });
        }
        let history = ctx.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].index, 1);
    }
}
