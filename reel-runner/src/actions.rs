use crate::duration_parser::duration_from_value;
use crate::errors::StepFailure;
use reel::{AutomationError, Backend};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Actions implemented by the runner on top of the backend surface.
pub const BUILTIN_ACTIONS: [&str; 11] = [
    "click",
    "type",
    "navigate",
    "wait",
    "screenshot",
    "scroll",
    "hover",
    "say",
    "log",
    "pause",
    "assert",
];

/// Actions that need special async handling around the backend.
pub const NATIVE_ACTIONS: [&str; 4] = ["evaluate", "inspect", "wait_for", "wait_ready"];

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_ACTIONS.contains(&name)
}

pub fn is_native(name: &str) -> bool {
    NATIVE_ACTIONS.contains(&name)
}

pub fn is_known(name: &str) -> bool {
    is_builtin(name) || is_native(name)
}

/// Field a scalar shorthand value is bound to, e.g. `{click: "Save"}` sets `target`.
pub fn primary_argument(action: &str) -> Option<&'static str> {
    let field = match action {
        "click" | "hover" => "target",
        "type" => "text",
        "navigate" => "url",
        "wait" => "duration",
        "screenshot" => "name",
        "scroll" => "to",
        "say" => "text",
        "log" | "pause" => "message",
        "assert" | "wait_for" => "condition",
        "evaluate" => "code",
        "inspect" => "store",
        "wait_ready" => "timeout",
        _ => return None,
    };
    Some(field)
}

/// Fields an action cannot run without.
pub fn required_fields(action: &str) -> &'static [&'static str] {
    match action {
        "click" | "hover" => &["target"],
        "type" => &["target", "text"],
        "navigate" => &["url"],
        "wait" => &["duration"],
        "screenshot" => &["name"],
        "say" => &["text"],
        "assert" => &["condition"],
        "evaluate" => &["code"],
        _ => &[],
    }
}

/// An action contributed by an external collaborator.
#[async_trait::async_trait]
pub trait ActionHandler: Send + Sync {
    /// Run the action with already-substituted arguments. A returned value is
    /// stored under the step's `store` variable when one is given.
    async fn call(
        &self,
        backend: &dyn Backend,
        args: &Map<String, Value>,
    ) -> Result<Option<Value>, AutomationError>;
}

/// Actions registered by name, consulted after built-ins and sub-scripts.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Argument extraction

fn describe_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => format!("string '{s}'"),
        Value::Array(_) => "list".to_string(),
        Value::Object(_) => "mapping".to_string(),
    }
}

fn missing(action: &str, field: &str) -> StepFailure {
    StepFailure::MissingField {
        action: action.to_string(),
        field: field.to_string(),
    }
}

fn mismatch(action: &str, field: &str, expected: &'static str, actual: &Value) -> StepFailure {
    StepFailure::TypeMismatch {
        action: action.to_string(),
        field: field.to_string(),
        expected,
        actual: describe_value(actual),
    }
}

/// Required text field. Numbers and booleans are accepted as their text form.
pub fn require_text(args: &Map<String, Value>, action: &str, field: &str) -> Result<String, StepFailure> {
    match args.get(field) {
        None | Some(Value::Null) => Err(missing(action, field)),
        Some(value) => text_value(value).ok_or_else(|| mismatch(action, field, "string", value)),
    }
}

pub fn optional_text(
    args: &Map<String, Value>,
    action: &str,
    field: &str,
) -> Result<Option<String>, StepFailure> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => text_value(value)
            .map(Some)
            .ok_or_else(|| mismatch(action, field, "string", value)),
    }
}

fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Optional numeric field, strictly typed.
pub fn optional_number(
    args: &Map<String, Value>,
    action: &str,
    field: &str,
) -> Result<Option<f64>, StepFailure> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(value) => Err(mismatch(action, field, "number", value)),
    }
}

pub fn require_duration(
    args: &Map<String, Value>,
    action: &str,
    field: &str,
) -> Result<Duration, StepFailure> {
    match args.get(field) {
        None | Some(Value::Null) => Err(missing(action, field)),
        Some(value) => {
            duration_from_value(value).ok_or_else(|| mismatch(action, field, "duration", value))
        }
    }
}

pub fn optional_duration(
    args: &Map<String, Value>,
    action: &str,
    field: &str,
) -> Result<Option<Duration>, StepFailure> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => duration_from_value(value)
            .map(Some)
            .ok_or_else(|| mismatch(action, field, "duration", value)),
    }
}
