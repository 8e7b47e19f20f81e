//! Failure classification and heuristic step repair.
//!
//! Repairs are best-effort rewrites of a failing step's record. A strategy never
//! touches the backend or the filesystem; the healing loop decides what to do
//! with the result.

use crate::actions::{is_known, primary_argument};
use crate::context::StepOutcome;
use crate::duration_parser::{duration_from_value, parse_duration};
use crate::errors::StepFailure;
use crate::snapshot::Snapshot;
use crate::step::is_option_key;
use once_cell::sync::Lazy;
use reel::{AutomationError, ElementInfo};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::debug;

pub const MIN_PAUSE_BEFORE: Duration = Duration::from_secs(1);
pub const MAX_PAUSE_BEFORE: Duration = Duration::from_secs(5);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(120);

/// Fields that name the element a step acts on, in lookup order.
const TARGET_FIELDS: [&str; 5] = ["target", "selector", "label", "field", "element"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    ElementNotFound,
    Timeout,
    UnknownAction,
    MissingRequiredField,
    TypeMismatch,
    NavigationError,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ElementNotFound => "element-not-found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::UnknownAction => "unknown-action",
            ErrorKind::MissingRequiredField => "missing-required-field",
            ErrorKind::TypeMismatch => "type-mismatch",
            ErrorKind::NavigationError => "navigation-error",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static MESSAGE_PATTERNS: Lazy<Vec<(Regex, ErrorKind)>> = Lazy::new(|| {
    [
        (
            r"(?i)not found|no such element|could not find|unable to locate|not enabled",
            ErrorKind::ElementNotFound,
        ),
        (r"(?i)timed?[ -]?out|deadline exceeded", ErrorKind::Timeout),
        (
            r"(?i)unknown action|unsupported action|no handler",
            ErrorKind::UnknownAction,
        ),
        (
            r"(?i)missing (required )?field|is required",
            ErrorKind::MissingRequiredField,
        ),
        (
            r"(?i)type mismatch|invalid type|expected \w+, got",
            ErrorKind::TypeMismatch,
        ),
        (
            r"(?i)navigat|net::err|dns|connection refused",
            ErrorKind::NavigationError,
        ),
    ]
    .into_iter()
    .map(|(pattern, kind)| {
        (
            Regex::new(pattern).expect("classifier pattern is valid"),
            kind,
        )
    })
    .collect()
});

/// Map a failure onto the closed error taxonomy: typed variant first, message second.
pub fn classify(failure: &StepFailure) -> ErrorKind {
    match failure {
        StepFailure::Backend(AutomationError::ElementNotFound(_))
        | StepFailure::Backend(AutomationError::ElementNotEnabled(_)) => {
            ErrorKind::ElementNotFound
        }
        StepFailure::Backend(AutomationError::Timeout(_)) => ErrorKind::Timeout,
        StepFailure::Backend(AutomationError::NavigationFailed(_)) => ErrorKind::NavigationError,
        StepFailure::UnknownAction(_) => ErrorKind::UnknownAction,
        StepFailure::MissingField { .. } => ErrorKind::MissingRequiredField,
        StepFailure::TypeMismatch { .. } => ErrorKind::TypeMismatch,
        other => classify_message(&other.to_string()),
    }
}

pub fn classify_message(message: &str) -> ErrorKind {
    MESSAGE_PATTERNS
        .iter()
        .find(|(pattern, _)| pattern.is_match(message))
        .map(|(_, kind)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixKind {
    SourcePatch,
    NoOp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FixResult {
    pub applied: bool,
    pub kind: FixKind,
    pub message: String,
    pub patched: Option<Value>,
}

impl FixResult {
    pub fn no_op(message: impl Into<String>) -> Self {
        Self {
            applied: false,
            kind: FixKind::NoOp,
            message: message.into(),
            patched: None,
        }
    }

    pub fn patch(record: Value, message: impl Into<String>) -> Self {
        Self {
            applied: true,
            kind: FixKind::SourcePatch,
            message: message.into(),
            patched: Some(record),
        }
    }
}

/// What a strategy may consult besides the failing record.
#[derive(Debug, Clone)]
pub struct RepairContext {
    pub snapshot: Option<Snapshot>,
    pub inventory: Vec<ElementInfo>,
    pub history: Vec<StepOutcome>,
    pub step_index: usize,
    pub default_timeout: Duration,
}

impl Default for RepairContext {
    fn default() -> Self {
        Self {
            snapshot: None,
            inventory: Vec::new(),
            history: Vec::new(),
            step_index: 0,
            default_timeout: Duration::from_secs(30),
        }
    }
}

pub trait RepairStrategy: Send + Sync {
    fn repair(
        &self,
        kind: ErrorKind,
        failure: &StepFailure,
        record: &Value,
        ctx: &RepairContext,
    ) -> FixResult;
}

/// Never fixes anything. Failures are retried as written.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRepair;

impl RepairStrategy for NoRepair {
    fn repair(&self, kind: ErrorKind, _: &StepFailure, _: &Value, _: &RepairContext) -> FixResult {
        FixResult::no_op(format!("repair disabled for {kind}"))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicRepair;

impl RepairStrategy for HeuristicRepair {
    fn repair(
        &self,
        kind: ErrorKind,
        failure: &StepFailure,
        record: &Value,
        ctx: &RepairContext,
    ) -> FixResult {
        let Some(mut view) = RecordView::new(record) else {
            return FixResult::no_op("step record is not a mapping");
        };
        let fix = match kind {
            ErrorKind::UnknownAction => fix_unknown_action(&mut view),
            ErrorKind::ElementNotFound => fix_missing_element(&mut view, ctx),
            ErrorKind::Timeout => fix_timeout(&mut view, ctx),
            ErrorKind::MissingRequiredField => match failure {
                StepFailure::MissingField { field, .. } => fix_missing_field(&mut view, field, ctx),
                _ => None,
            },
            ErrorKind::TypeMismatch => match failure {
                StepFailure::TypeMismatch {
                    field, expected, ..
                } => fix_type_mismatch(&mut view, field, expected, ctx),
                _ => None,
            },
            ErrorKind::NavigationError | ErrorKind::Unknown => None,
        };
        match fix {
            Some(message) => {
                debug!("Heuristic repair for {}: {}", kind, message);
                FixResult::patch(view.into_value(), message)
            }
            None => FixResult::no_op(format!("no heuristic fix for {kind}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Record editing

#[derive(Debug, Clone, PartialEq)]
enum Form {
    /// `{action: name, field: value, ...}`
    Keyed,
    /// `{name: value}` with `value` a scalar or an argument mapping
    Shorthand(String),
    /// Argument fields with no action named
    Anonymous,
}

struct RecordView {
    map: Map<String, Value>,
    form: Form,
}

impl RecordView {
    fn new(record: &Value) -> Option<Self> {
        let map = match record {
            Value::Object(map) => map.clone(),
            Value::String(name) => {
                let mut map = Map::new();
                map.insert(name.trim().to_string(), Value::Null);
                map
            }
            _ => return None,
        };
        let form = if map.get("action").is_some_and(Value::is_string) {
            Form::Keyed
        } else {
            let keys: Vec<&String> = map.keys().filter(|k| !is_option_key(k)).collect();
            match keys.as_slice() {
                [key] => Form::Shorthand((*key).clone()),
                _ => Form::Anonymous,
            }
        };
        Some(Self { map, form })
    }

    fn action(&self) -> Option<String> {
        match &self.form {
            Form::Keyed => self.map.get("action").and_then(Value::as_str).map(String::from),
            Form::Shorthand(name) => Some(name.clone()),
            Form::Anonymous => None,
        }
    }

    fn shorthand_field(name: &str) -> &'static str {
        primary_argument(name).unwrap_or("value")
    }

    fn arg(&self, field: &str) -> Option<&Value> {
        match &self.form {
            Form::Shorthand(name) => match self.map.get(name) {
                Some(Value::Object(args)) => args.get(field),
                Some(Value::Null) | None => None,
                Some(scalar) => (Self::shorthand_field(name) == field).then_some(scalar),
            },
            Form::Keyed | Form::Anonymous => self.map.get(field),
        }
    }

    fn set_arg(&mut self, field: &str, value: Value) {
        let Form::Shorthand(name) = &self.form else {
            self.map.insert(field.to_string(), value);
            return;
        };
        let primary = Self::shorthand_field(name);
        let slot = self.map.entry(name.clone()).or_insert(Value::Null);
        match slot {
            Value::Object(args) => {
                args.insert(field.to_string(), value);
            }
            Value::Null => {
                let mut args = Map::new();
                args.insert(field.to_string(), value);
                *slot = Value::Object(args);
            }
            scalar if field == primary => *scalar = value,
            scalar => {
                let mut args = Map::new();
                args.insert(primary.to_string(), scalar.take());
                args.insert(field.to_string(), value);
                *scalar = Value::Object(args);
            }
        }
    }

    fn rename(&mut self, to: &str) {
        match self.form.clone() {
            Form::Keyed => {
                self.map.insert("action".to_string(), Value::String(to.to_string()));
            }
            Form::Shorthand(from) => {
                let value = self.map.remove(&from).unwrap_or(Value::Null);
                let value = match value {
                    Value::Object(args) => Value::Object(normalize_fields(args, to)),
                    other => other,
                };
                self.map.insert(to.to_string(), value);
                self.form = Form::Shorthand(to.to_string());
            }
            Form::Anonymous => {
                let args = std::mem::take(&mut self.map);
                let mut map = Map::new();
                map.insert("action".to_string(), Value::String(to.to_string()));
                map.extend(normalize_fields(args, to));
                self.map = map;
                self.form = Form::Keyed;
            }
        }
        if self.form == Form::Keyed {
            let map = std::mem::take(&mut self.map);
            self.map = normalize_fields(map, to);
        }
    }

    fn option(&self, key: &str) -> Option<Duration> {
        self.map.get(key).and_then(duration_from_value)
    }

    fn set_option(&mut self, key: &str, value: Duration) {
        self.map.insert(key.to_string(), json!(value.as_millis() as u64));
    }

    fn into_value(self) -> Value {
        Value::Object(self.map)
    }
}

/// Rename well-known field aliases to the names `action` reads.
fn normalize_fields(args: Map<String, Value>, action: &str) -> Map<String, Value> {
    args.into_iter()
        .map(|(key, value)| {
            let renamed = match (action, key.as_str()) {
                (_, "selector" | "element") => "target".to_string(),
                ("type", "value") => "text".to_string(),
                ("navigate", "href" | "link") => "url".to_string(),
                _ => key,
            };
            (renamed, value)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Heuristics

fn renamed_action(name: &str) -> Option<&'static str> {
    let normalized = name.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    let renamed = match normalized.as_str() {
        "click_button" | "click_element" | "click_on" | "press_button" | "tap" => "click",
        "fill" | "fill_in" | "input" | "enter_text" | "type_text" | "write" => "type",
        "goto" | "go_to" | "open" | "visit" | "open_url" | "navigate_to" => "navigate",
        "sleep" | "delay" | "wait_for_ms" => "wait",
        "capture" | "take_screenshot" | "snap" => "screenshot",
        "print" | "echo" => "log",
        "speak" | "announce" => "say",
        "eval" | "execute_js" | "run_js" | "js" => "evaluate",
        "mouse_over" | "hover_over" => "hover",
        "expect" | "check" | "verify" => "assert",
        other => return crate::actions::BUILTIN_ACTIONS
            .iter()
            .chain(crate::actions::NATIVE_ACTIONS.iter())
            .find(|known| **known == other)
            .copied(),
    };
    Some(renamed)
}

fn has_target(view: &RecordView) -> bool {
    TARGET_FIELDS.iter().any(|field| view.arg(field).is_some())
}

fn infer_action(view: &RecordView) -> Option<&'static str> {
    if view.arg("url").is_some() {
        Some("navigate")
    } else if view.arg("text").is_some() && has_target(view) {
        Some("type")
    } else if has_target(view) {
        Some("click")
    } else if view.arg("code").is_some() {
        Some("evaluate")
    } else if view.arg("duration").is_some() {
        Some("wait")
    } else {
        None
    }
}

fn fix_unknown_action(view: &mut RecordView) -> Option<String> {
    match view.action() {
        Some(name) if name.is_empty() => {
            let inferred = infer_action(view)?;
            view.rename(inferred);
            Some(format!("set missing action to '{inferred}'"))
        }
        Some(name) => {
            let renamed = renamed_action(&name)?;
            if renamed == name || !is_known(renamed) {
                return None;
            }
            view.rename(renamed);
            Some(format!("renamed action '{name}' to '{renamed}'"))
        }
        None => {
            let inferred = infer_action(view)?;
            view.rename(inferred);
            Some(format!("inferred action '{inferred}' from step fields"))
        }
    }
}

fn target_field(view: &RecordView) -> Option<(&'static str, String)> {
    TARGET_FIELDS.iter().find_map(|field| match view.arg(field) {
        Some(Value::String(target)) => Some((*field, target.clone())),
        _ => None,
    })
}

/// Closest inventory element to `target`. Labels containing the target win over
/// labels the target contains; ties go to inventory order.
pub fn closest_element<'a>(target: &str, inventory: &'a [ElementInfo]) -> Option<&'a ElementInfo> {
    let needle = target.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    let candidates = || {
        inventory
            .iter()
            .filter(|e| !e.label.trim().is_empty() && e.label != target)
    };
    candidates()
        .find(|e| e.label.to_lowercase().contains(&needle))
        .or_else(|| {
            candidates().find(|e| {
                let label = e.label.trim().to_lowercase();
                label.chars().count() >= 3 && needle.contains(&label)
            })
        })
}

fn fix_missing_element(view: &mut RecordView, ctx: &RepairContext) -> Option<String> {
    if let Some((field, target)) = target_field(view) {
        if let Some(element) = closest_element(&target, &ctx.inventory) {
            let label = element.label.clone();
            view.set_arg(field, Value::String(label.clone()));
            return Some(format!("retargeted '{target}' to '{label}'"));
        }
    }

    let pause = view.option("pause_before");
    let next_pause = match pause {
        None => MIN_PAUSE_BEFORE,
        Some(p) => (p * 2).clamp(MIN_PAUSE_BEFORE, MAX_PAUSE_BEFORE),
    };
    let timeout = view.option("timeout");
    let next_timeout = doubled_timeout(timeout, ctx.default_timeout);

    let mut changes = Vec::new();
    if pause != Some(next_pause) {
        view.set_option("pause_before", next_pause);
        changes.push(format!("pause_before {}ms", next_pause.as_millis()));
    }
    if timeout != Some(next_timeout) {
        view.set_option("timeout", next_timeout);
        changes.push(format!("timeout {}ms", next_timeout.as_millis()));
    }
    if changes.is_empty() {
        None
    } else {
        Some(format!("waiting longer: {}", changes.join(", ")))
    }
}

fn doubled_timeout(current: Option<Duration>, default: Duration) -> Duration {
    (current.unwrap_or(default).max(default) * 2).min(MAX_TIMEOUT)
}

fn fix_timeout(view: &mut RecordView, ctx: &RepairContext) -> Option<String> {
    let current = view.option("timeout");
    let next = doubled_timeout(current, ctx.default_timeout);
    if current == Some(next) {
        return None;
    }
    view.set_option("timeout", next);
    Some(format!("raised timeout to {}ms", next.as_millis()))
}

fn default_for(field: &str, ctx: &RepairContext) -> Option<Value> {
    let value = match field {
        "text" => json!(""),
        "url" => {
            let location = ctx
                .snapshot
                .as_ref()
                .map(|s| s.location.clone())
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| "about:blank".to_string());
            json!(location)
        }
        "name" => json!(format!("step-{}", ctx.step_index)),
        "duration" => json!(1000),
        _ => return None,
    };
    Some(value)
}

fn fix_missing_field(view: &mut RecordView, field: &str, ctx: &RepairContext) -> Option<String> {
    let value = default_for(field, ctx)?;
    let message = format!("filled missing '{field}' with {value}");
    view.set_arg(field, value);
    Some(message)
}

fn coerce(value: &Value, expected: &str) -> Option<Value> {
    match (expected, value) {
        ("string", Value::Array(items)) => Some(json!(items
            .iter()
            .map(crate::expression_eval::display_string)
            .collect::<Vec<_>>()
            .join(" "))),
        ("string", other) => Some(json!(crate::expression_eval::display_string(other))),
        ("number", Value::String(s)) => s.trim().parse::<f64>().ok().map(|n| json!(n)),
        ("number", Value::Bool(b)) => Some(json!(u8::from(*b))),
        ("duration", Value::String(s)) => leading_duration(s).map(|d| json!(d.as_millis() as u64)),
        ("duration", Value::Bool(_) | Value::Array(_) | Value::Object(_)) => Some(json!(1000)),
        _ => None,
    }
}

static LEADING_DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*([a-zA-Z]*)").expect("duration pattern is valid")
});

/// Salvage a duration from loose text like "about 2 seconds".
fn leading_duration(text: &str) -> Option<Duration> {
    let caps = LEADING_DURATION_RE.captures(text)?;
    parse_duration(&format!("{}{}", &caps[1], &caps[2]))
        .or_else(|_| parse_duration(&caps[1]))
        .ok()
}

fn fix_type_mismatch(
    view: &mut RecordView,
    field: &str,
    expected: &str,
    ctx: &RepairContext,
) -> Option<String> {
    match view.arg(field).cloned() {
        Some(current) => {
            let coerced = coerce(&current, expected)?;
            if coerced == current {
                return None;
            }
            view.set_arg(field, coerced.clone());
            Some(format!("coerced '{field}' to {expected} {coerced}"))
        }
        None => fix_missing_field(view, field, ctx),
    }
}
