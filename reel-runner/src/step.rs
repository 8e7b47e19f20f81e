use crate::actions;
use crate::duration_parser::duration_from_value;
use crate::errors::ScriptError;
use reel::PageOperation;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub type StepId = u64;

static NEXT_STEP_ID: AtomicU64 = AtomicU64::new(1);

static NO_STEPS: Value = Value::Null;

/// Hidden key the resolver uses to tell each record where it came from.
pub const ORIGIN_KEY: &str = "__origin__";
/// Key carrying composition target and parameters on flattened steps.
pub const COMPOSE_MARKER_KEY: &str = "__compose__";

/// Keys that modify how a step runs rather than what it does.
const OPTION_KEYS: [&str; 8] = [
    "wait",
    "static",
    "timeout",
    "pause_before",
    "description",
    "id",
    COMPOSE_MARKER_KEY,
    ORIGIN_KEY,
];

/// Keys whose values are nested step lists.
const NESTED_LIST_KEYS: [&str; 7] = ["steps", "do", "then", "else", "try", "catch", "finally"];

/// Where a step record lives on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOrigin {
    pub path: PathBuf,
    /// JSON pointer to the record inside the document
    pub pointer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeMarker {
    pub target: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOptions {
    pub wait: bool,
    pub is_static: bool,
    pub timeout: Option<Duration>,
    pub pause_before: Option<Duration>,
    pub description: Option<String>,
    pub label: Option<String>,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            wait: true,
            is_static: false,
            timeout: None,
            pause_before: None,
            description: None,
            label: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopBinding {
    Single(String),
    Pair(String, String),
}

impl LoopBinding {
    pub fn names(&self) -> Vec<&str> {
        match self {
            LoopBinding::Single(name) => vec![name.as_str()],
            LoopBinding::Pair(key, value) => vec![key.as_str(), value.as_str()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Branch {
    pub condition: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub enum StepKind {
    Sequence(Vec<Step>),
    /// Composition that was not flattened at load time
    Compose {
        target: String,
        params: Map<String, Value>,
    },
    Loop {
        binding: LoopBinding,
        iterable: String,
        body: Vec<Step>,
    },
    Conditional {
        branches: Vec<Branch>,
        otherwise: Vec<Step>,
    },
    Assign(Vec<Assignment>),
    Try {
        body: Vec<Step>,
        catch: Vec<Step>,
        finally: Vec<Step>,
    },
    Operation(PageOperation),
    /// A named action. `name` is empty when the record names none.
    Action {
        name: String,
        args: Map<String, Value>,
    },
}

/// One parsed node of a script's control-flow tree.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: StepId,
    pub kind: StepKind,
    pub options: StepOptions,
    /// The record as written, with resolver annotations removed
    pub raw: Value,
    pub origin: Option<StepOrigin>,
    pub compose: Option<ComposeMarker>,
    /// JSON pointer of this record relative to its top-level step
    pub local_pointer: String,
}

impl Step {
    pub fn parse(raw: Value) -> Result<Step, ScriptError> {
        Self::parse_at(raw, String::new())
    }

    fn parse_at(mut raw: Value, local_pointer: String) -> Result<Step, ScriptError> {
        let origin = take_origin(&mut raw);
        let location = origin
            .as_ref()
            .map(|o| format!("{}#{}", o.path.display(), o.pointer))
            .unwrap_or_else(|| format!("#{local_pointer}"));
        let invalid = |message: String| ScriptError::InvalidStep {
            location: location.clone(),
            message,
        };

        let (kind, options, compose) = match &raw {
            Value::String(name) => {
                let kind = match PageOperation::from_name(name.trim()) {
                    Some(op) => StepKind::Operation(op),
                    None => StepKind::Action {
                        name: name.trim().to_string(),
                        args: Map::new(),
                    },
                };
                (kind, StepOptions::default(), None)
            }
            Value::Object(map) => {
                let options = parse_options(map);
                let compose = match map.get(COMPOSE_MARKER_KEY) {
                    Some(marker) => Some(
                        serde_json::from_value::<ComposeMarker>(marker.clone())
                            .map_err(|e| invalid(format!("bad composition marker: {e}")))?,
                    ),
                    None => None,
                };
                let kind = parse_kind(map, &local_pointer).map_err(invalid)?;
                (kind, options, compose)
            }
            other => return Err(invalid(format!("expected a mapping or string, got {other}"))),
        };

        strip_annotations(&mut raw);
        Ok(Step {
            id: NEXT_STEP_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            options,
            raw,
            origin,
            compose,
            local_pointer,
        })
    }

    /// Short label for logs and records.
    pub fn action_name(&self) -> String {
        match &self.kind {
            StepKind::Sequence(_) => "sequence".to_string(),
            StepKind::Compose { target, .. } => format!("compose:{target}"),
            StepKind::Loop { .. } => "for".to_string(),
            StepKind::Conditional { .. } => "if".to_string(),
            StepKind::Assign(_) => "set".to_string(),
            StepKind::Try { .. } => "try".to_string(),
            StepKind::Operation(op) => op.name().to_string(),
            StepKind::Action { name, .. } if name.is_empty() => "<none>".to_string(),
            StepKind::Action { name, .. } => name.clone(),
        }
    }

    pub fn children(&self) -> Vec<&Step> {
        match &self.kind {
            StepKind::Sequence(body) | StepKind::Loop { body, .. } => body.iter().collect(),
            StepKind::Conditional { branches, otherwise } => branches
                .iter()
                .flat_map(|b| b.steps.iter())
                .chain(otherwise.iter())
                .collect(),
            StepKind::Try {
                body,
                catch,
                finally,
            } => body.iter().chain(catch).chain(finally).collect(),
            _ => Vec::new(),
        }
    }

    fn children_mut(&mut self) -> Vec<&mut Step> {
        match &mut self.kind {
            StepKind::Sequence(body) | StepKind::Loop { body, .. } => body.iter_mut().collect(),
            StepKind::Conditional { branches, otherwise } => branches
                .iter_mut()
                .flat_map(|b| b.steps.iter_mut())
                .chain(otherwise.iter_mut())
                .collect(),
            StepKind::Try {
                body,
                catch,
                finally,
            } => body
                .iter_mut()
                .chain(catch.iter_mut())
                .chain(finally.iter_mut())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn find(&self, id: StepId) -> Option<&Step> {
        if self.id == id {
            return Some(self);
        }
        self.children().into_iter().find_map(|child| child.find(id))
    }

    /// Replace `target` (this step or a descendant) with the record `patched`.
    /// Ancestors keep their raw records in sync. Returns false if `target` is not here.
    pub fn replace_descendant(&mut self, target: &Step, patched: Value) -> Result<bool, ScriptError> {
        if self.id == target.id {
            let mut replacement = Step::parse_at(patched, self.local_pointer.clone())?;
            if replacement.origin.is_none() {
                replacement.origin = self.origin.clone();
            }
            *self = replacement;
            return Ok(true);
        }

        let relative = match target.local_pointer.strip_prefix(self.local_pointer.as_str()) {
            Some(rel) if rel.starts_with('/') => rel.to_string(),
            _ => return Ok(false),
        };

        let mut replaced = false;
        for child in self.children_mut() {
            if child.replace_descendant(target, patched.clone())? {
                replaced = true;
                break;
            }
        }
        if replaced {
            if let Some(slot) = self.raw.pointer_mut(&relative) {
                *slot = patched;
                strip_annotations(slot);
            }
        }
        Ok(replaced)
    }
}

fn take_origin(raw: &mut Value) -> Option<StepOrigin> {
    let map = raw.as_object_mut()?;
    let origin = map.remove(ORIGIN_KEY)?;
    serde_json::from_value(origin).ok()
}

/// Remove resolver annotations from a record and everything nested in it.
pub fn strip_annotations(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove(ORIGIN_KEY);
            for (_, nested) in map.iter_mut() {
                strip_annotations(nested);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_annotations),
        _ => {}
    }
}

pub fn is_nested_list_key(key: &str) -> bool {
    NESTED_LIST_KEYS.contains(&key)
}

pub fn is_option_key(key: &str) -> bool {
    OPTION_KEYS.contains(&key)
}

fn parse_options(map: &Map<String, Value>) -> StepOptions {
    let mut options = StepOptions::default();
    if let Some(Value::Bool(wait)) = map.get("wait") {
        options.wait = *wait;
    }
    if let Some(Value::Bool(is_static)) = map.get("static") {
        options.is_static = *is_static;
    }
    options.timeout = map.get("timeout").and_then(duration_from_value);
    options.pause_before = map.get("pause_before").and_then(duration_from_value);
    options.description = map.get("description").and_then(Value::as_str).map(String::from);
    options.label = map.get("id").and_then(Value::as_str).map(String::from);
    options
}

fn significant_keys(map: &Map<String, Value>) -> Vec<&str> {
    map.keys()
        .map(String::as_str)
        .filter(|key| !OPTION_KEYS.contains(key))
        .collect()
}

fn parse_kind(map: &Map<String, Value>, local: &str) -> Result<StepKind, String> {
    if let Some(target) = map.get("compose") {
        let target = target
            .as_str()
            .ok_or_else(|| "compose target must be a string".to_string())?;
        let params = match map.get("params") {
            Some(Value::Object(params)) => params.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => return Err("compose params must be a mapping".to_string()),
        };
        return Ok(StepKind::Compose {
            target: target.to_string(),
            params,
        });
    }

    if let Some(spec) = map.get("for") {
        let spec = spec
            .as_str()
            .ok_or_else(|| "for must be a string like 'item in items'".to_string())?;
        let (binding, iterable) = parse_loop_spec(spec)?;
        let (key, list) = match (map.get("steps"), map.get("do")) {
            (Some(list), _) => ("steps", list),
            (None, Some(list)) => ("do", list),
            (None, None) => return Err("for needs a 'steps' list".to_string()),
        };
        let body = parse_list(list, &format!("{local}/{key}"))?;
        return Ok(StepKind::Loop {
            binding,
            iterable,
            body,
        });
    }

    if let Some(condition) = map.get("if") {
        let (key, then) = match (map.get("then"), map.get("steps")) {
            (Some(list), _) => ("then", list),
            (None, Some(list)) => ("steps", list),
            (None, None) => ("then", &NO_STEPS),
        };
        let mut branches = vec![Branch {
            condition: condition_text(condition),
            steps: parse_list(then, &format!("{local}/{key}"))?,
        }];
        if let Some(elifs) = map.get("elif") {
            let elifs = elifs
                .as_array()
                .ok_or_else(|| "elif must be a list of branches".to_string())?;
            for (i, branch) in elifs.iter().enumerate() {
                branches.push(parse_branch(branch, &format!("{local}/elif/{i}"))?);
            }
        }
        let otherwise = match map.get("else") {
            Some(list) => parse_list(list, &format!("{local}/else"))?,
            None => Vec::new(),
        };
        return Ok(StepKind::Conditional {
            branches,
            otherwise,
        });
    }

    if let Some(set) = map.get("set") {
        return parse_assignments(set).map(StepKind::Assign);
    }

    if let Some(body) = map.get("try") {
        let body = parse_list(body, &format!("{local}/try"))?;
        let catch = match map.get("catch") {
            Some(list) => parse_list(list, &format!("{local}/catch"))?,
            None => Vec::new(),
        };
        let finally = match map.get("finally") {
            Some(list) => parse_list(list, &format!("{local}/finally"))?,
            None => Vec::new(),
        };
        return Ok(StepKind::Try {
            body,
            catch,
            finally,
        });
    }

    if let Some(name) = map.get("action") {
        let name = name
            .as_str()
            .ok_or_else(|| "action must be a string".to_string())?;
        let args = map
            .iter()
            .filter(|(key, _)| key.as_str() != "action" && !OPTION_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        return Ok(StepKind::Action {
            name: name.trim().to_string(),
            args,
        });
    }

    let keys = significant_keys(map);
    match keys.as_slice() {
        ["steps"] => {
            let body = parse_list(&map["steps"], &format!("{local}/steps"))?;
            Ok(StepKind::Sequence(body))
        }
        [key] => {
            let value = &map[*key];
            if let Some(op) = PageOperation::from_name(key) {
                if matches!(value, Value::Null | Value::Bool(true))
                    || value.as_object().is_some_and(Map::is_empty)
                {
                    return Ok(StepKind::Operation(op));
                }
            }
            Ok(StepKind::Action {
                name: key.to_string(),
                args: shorthand_args(key, value),
            })
        }
        _ => Ok(StepKind::Action {
            name: String::new(),
            args: keys
                .iter()
                .map(|key| (key.to_string(), map[*key].clone()))
                .collect(),
        }),
    }
}

/// Arguments of a `{name: value}` shorthand step.
pub fn shorthand_args(name: &str, value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(args) => args.clone(),
        Value::Null => Map::new(),
        scalar => {
            let field = actions::primary_argument(name).unwrap_or("value");
            let mut args = Map::new();
            args.insert(field.to_string(), scalar.clone());
            args
        }
    }
}

fn parse_list(value: &Value, pointer: &str) -> Result<Vec<Step>, String> {
    let items = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        other => return Err(format!("expected a list of steps at {pointer}, got {other}")),
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            Step::parse_at(item.clone(), format!("{pointer}/{i}")).map_err(|e| e.to_string())
        })
        .collect()
}

fn parse_branch(value: &Value, pointer: &str) -> Result<Branch, String> {
    let map = value
        .as_object()
        .ok_or_else(|| format!("elif branch at {pointer} must be a mapping"))?;
    let condition = map
        .get("if")
        .or_else(|| map.get("elif"))
        .ok_or_else(|| format!("elif branch at {pointer} has no condition"))?;
    let (key, list) = match (map.get("then"), map.get("steps")) {
        (Some(list), _) => ("then", list),
        (None, Some(list)) => ("steps", list),
        (None, None) => ("then", &NO_STEPS),
    };
    Ok(Branch {
        condition: condition_text(condition),
        steps: parse_list(list, &format!("{pointer}/{key}"))?,
    })
}

fn condition_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_loop_spec(spec: &str) -> Result<(LoopBinding, String), String> {
    let (vars, iterable) = spec
        .split_once(" in ")
        .ok_or_else(|| format!("for '{spec}' must look like '<var> in <expr>'"))?;
    let iterable = iterable.trim();
    if iterable.is_empty() {
        return Err(format!("for '{spec}' has no iterable"));
    }
    let names: Vec<&str> = vars.split(',').map(str::trim).collect();
    for name in &names {
        if !is_identifier(name) {
            return Err(format!("'{name}' is not a valid loop variable"));
        }
    }
    let binding = match names.as_slice() {
        [single] => LoopBinding::Single(single.to_string()),
        [key, value] => LoopBinding::Pair(key.to_string(), value.to_string()),
        _ => return Err(format!("for '{spec}' binds too many variables")),
    };
    Ok((binding, iterable.to_string()))
}

fn parse_assignments(value: &Value) -> Result<Vec<Assignment>, String> {
    match value {
        Value::String(text) => Ok(vec![parse_assignment_text(text)?]),
        Value::Object(map) => Ok(map
            .iter()
            .map(|(name, value)| Assignment {
                name: name.clone(),
                value: value.clone(),
            })
            .collect()),
        Value::Array(items) => {
            let mut assignments = Vec::new();
            for item in items {
                assignments.extend(parse_assignments(item)?);
            }
            Ok(assignments)
        }
        other => Err(format!("set must be 'name = expr' or a mapping, got {other}")),
    }
}

fn parse_assignment_text(text: &str) -> Result<Assignment, String> {
    let (name, rhs) = text
        .split_once('=')
        .ok_or_else(|| format!("set '{text}' must look like 'name = expr'"))?;
    let name = name.trim();
    if !is_identifier(name) || rhs.starts_with('=') {
        return Err(format!("set '{text}' must look like 'name = expr'"));
    }
    Ok(Assignment {
        name: name.to_string(),
        value: Value::String(rhs.trim().to_string()),
    })
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}
