//! Flattens inheritance, includes and composition into one step list.
//!
//! Resolution happens on raw records before any step is parsed. Records read from
//! a file are annotated with their location so repairs can be written back to the
//! file they came from, including records pulled in from parents, includes and
//! composed sub-scripts.

use crate::errors::ScriptError;
use crate::script::Script;
use crate::step::{is_nested_list_key, Step, StepOrigin, COMPOSE_MARKER_KEY, ORIGIN_KEY};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const DEFAULT_EXTENSIONS: [&str; 2] = ["yaml", "yml"];
const CONVENTIONAL_DIRS: [&str; 3] = ["scripts", "includes", "lib"];

/// A script after inheritance, includes and composition, with every step parsed.
#[derive(Debug, Clone, Default)]
pub struct FlatScript {
    pub name: Option<String>,
    pub description: Option<String>,
    pub config: Map<String, Value>,
    pub setup: Vec<Step>,
    pub steps: Vec<Step>,
    pub teardown: Vec<Step>,
    /// Every file read while resolving, the entry script first
    pub sources: Vec<PathBuf>,
    pub base_dir: PathBuf,
}

impl FlatScript {
    /// The flattened document. Resolving it again yields the same steps.
    pub fn to_script(&self) -> Script {
        let raws = |steps: &[Step]| steps.iter().map(|s| s.raw.clone()).collect::<Vec<_>>();
        let optional = |steps: &[Step]| {
            if steps.is_empty() {
                None
            } else {
                Some(raws(steps))
            }
        };
        Script {
            name: self.name.clone(),
            description: self.description.clone(),
            extends: None,
            includes: Vec::new(),
            config: self.config.clone(),
            setup: optional(&self.setup),
            steps: raws(&self.steps),
            teardown: optional(&self.teardown),
        }
    }
}

#[derive(Debug, Default)]
struct Resolution {
    name: Option<String>,
    description: Option<String>,
    config: Map<String, Value>,
    setup: Option<Vec<Value>>,
    steps: Vec<Value>,
    teardown: Option<Vec<Value>>,
}

/// Bookkeeping shared across one resolution.
#[derive(Default)]
struct Walk {
    chain: Vec<PathBuf>,
    sources: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptResolver {
    search_dirs: Vec<PathBuf>,
}

impl ScriptResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra directories searched after the base directory's conventional ones.
    pub fn with_search_dirs(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }

    /// Candidate paths for `reference`, in lookup order.
    pub fn candidates(&self, reference: &str, base_dir: &Path) -> Vec<PathBuf> {
        let reference = Path::new(reference.trim());
        let with_extensions = |path: PathBuf| {
            let mut paths = vec![path.clone()];
            for ext in DEFAULT_EXTENSIONS {
                let mut name = path.clone().into_os_string();
                name.push(format!(".{ext}"));
                paths.push(PathBuf::from(name));
            }
            paths
        };

        if reference.is_absolute() {
            return with_extensions(reference.to_path_buf());
        }

        let mut dirs = vec![base_dir.to_path_buf()];
        dirs.extend(CONVENTIONAL_DIRS.iter().map(|d| base_dir.join(d)));
        for extra in &self.search_dirs {
            dirs.push(extra.clone());
            dirs.extend(CONVENTIONAL_DIRS.iter().map(|d| extra.join(d)));
        }

        dirs.into_iter()
            .flat_map(|dir| with_extensions(dir.join(reference)))
            .collect()
    }

    pub fn find_script(&self, reference: &str, base_dir: &Path) -> Option<PathBuf> {
        if reference.trim().is_empty() {
            return None;
        }
        self.candidates(reference, base_dir)
            .into_iter()
            .find(|candidate| candidate.is_file())
    }

    /// Load and flatten the script at `path`.
    pub fn resolve_file(&self, path: &Path) -> Result<FlatScript, ScriptError> {
        let mut walk = Walk::default();
        let resolution = self.resolve_path(path, &mut walk)?;
        let base_dir = walk
            .sources
            .first()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        finish(resolution, walk.sources, base_dir)
    }

    /// Flatten an in-memory script. References resolve against `base_dir`.
    pub fn resolve(&self, script: &Script, base_dir: &Path) -> Result<FlatScript, ScriptError> {
        let mut walk = Walk::default();
        let resolution = self.resolve_document(script, None, base_dir, &mut walk)?;
        finish(resolution, walk.sources, base_dir.to_path_buf())
    }

    fn resolve_path(&self, path: &Path, walk: &mut Walk) -> Result<Resolution, ScriptError> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if walk.chain.contains(&path) {
            return Err(ScriptError::Cycle(path));
        }
        if !walk.sources.contains(&path) {
            walk.sources.push(path.clone());
        }

        let script = Script::load(&path)?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        walk.chain.push(path.clone());
        let result = self.resolve_document(&script, Some(&path), &base_dir, walk);
        walk.chain.pop();
        result
    }

    fn resolve_document(
        &self,
        script: &Script,
        source: Option<&Path>,
        base_dir: &Path,
        walk: &mut Walk,
    ) -> Result<Resolution, ScriptError> {
        let annotated = |list: &[Value], key: &str| -> Vec<Value> {
            list.iter()
                .enumerate()
                .map(|(i, record)| {
                    let mut record = record.clone();
                    if let Some(path) = source {
                        annotate(&mut record, path, &format!("/{key}/{i}"));
                    }
                    record
                })
                .collect()
        };

        let mut resolution = Resolution {
            name: script.name.clone(),
            description: script.description.clone(),
            config: script.config.clone(),
            setup: script.setup.as_deref().map(|list| annotated(list, "setup")),
            steps: annotated(&script.steps, "steps"),
            teardown: script.teardown.as_deref().map(|list| annotated(list, "teardown")),
        };

        if let Some(parent_ref) = &script.extends {
            let parent_path =
                self.find_script(parent_ref, base_dir)
                    .ok_or_else(|| ScriptError::ParentNotFound {
                        reference: parent_ref.clone(),
                        base: base_dir.to_path_buf(),
                    })?;
            debug!("Resolving parent script {}", parent_path.display());
            let parent = self.resolve_path(&parent_path, walk)?;
            resolution = inherit(parent, resolution);
        }

        let mut included = Vec::new();
        for include in &script.includes {
            let Some(path) = self.find_script(include, base_dir) else {
                warn!("Include '{}' not found from {}; skipping", include, base_dir.display());
                continue;
            };
            match self.resolve_path(&path, walk) {
                Ok(resolved) => included.extend(resolved.steps),
                Err(e) => warn!("Skipping include '{}': {}", include, e),
            }
        }
        if !included.is_empty() {
            included.append(&mut resolution.steps);
            resolution.steps = included;
        }

        resolution.setup = resolution
            .setup
            .map(|list| self.expand_list(list, base_dir, walk));
        resolution.steps = self.expand_list(std::mem::take(&mut resolution.steps), base_dir, walk);
        resolution.teardown = resolution
            .teardown
            .map(|list| self.expand_list(list, base_dir, walk));

        Ok(resolution)
    }

    /// Replace `compose` records with the steps of the sub-script they name.
    fn expand_list(&self, list: Vec<Value>, base_dir: &Path, walk: &mut Walk) -> Vec<Value> {
        let mut expanded = Vec::with_capacity(list.len());
        for mut record in list {
            if let Some(target) = compose_target(&record) {
                match self.compose(&record, &target, base_dir, walk) {
                    Some(steps) => {
                        expanded.extend(steps);
                        continue;
                    }
                    None => warn!(
                        "Composition target '{}' unavailable; leaving it to fail at execution",
                        target
                    ),
                }
            }
            self.expand_nested(&mut record, base_dir, walk);
            expanded.push(record);
        }
        expanded
    }

    fn compose(
        &self,
        record: &Value,
        target: &str,
        base_dir: &Path,
        walk: &mut Walk,
    ) -> Option<Vec<Value>> {
        let path = self.find_script(target, base_dir)?;
        let sub = match self.resolve_path(&path, walk) {
            Ok(sub) => sub,
            Err(e) => {
                warn!("Could not resolve composition '{}': {}", target, e);
                return None;
            }
        };
        let params = record
            .get("params")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Some(
            sub.steps
                .into_iter()
                .map(|step| with_compose_marker(step, target, &params))
                .collect(),
        )
    }

    fn expand_nested(&self, record: &mut Value, base_dir: &Path, walk: &mut Walk) {
        let Some(map) = record.as_object_mut() else {
            return;
        };
        for (key, value) in map.iter_mut() {
            if key == "elif" {
                if let Value::Array(branches) = value {
                    for branch in branches.iter_mut() {
                        self.expand_nested(branch, base_dir, walk);
                    }
                }
            } else if is_nested_list_key(key) {
                if let Value::Array(list) = value {
                    let taken = std::mem::take(list);
                    *list = self.expand_list(taken, base_dir, walk);
                }
            }
        }
    }
}

fn finish(
    resolution: Resolution,
    sources: Vec<PathBuf>,
    base_dir: PathBuf,
) -> Result<FlatScript, ScriptError> {
    let parse_all =
        |list: Vec<Value>| list.into_iter().map(Step::parse).collect::<Result<Vec<_>, _>>();
    Ok(FlatScript {
        name: resolution.name,
        description: resolution.description,
        config: resolution.config,
        setup: parse_all(resolution.setup.unwrap_or_default())?,
        steps: parse_all(resolution.steps)?,
        teardown: parse_all(resolution.teardown.unwrap_or_default())?,
        sources,
        base_dir,
    })
}

/// Merge a resolved parent under a child: parent steps first, child config wins.
fn inherit(parent: Resolution, child: Resolution) -> Resolution {
    let mut config = parent.config;
    config.extend(child.config);
    let mut steps = parent.steps;
    steps.extend(child.steps);
    Resolution {
        name: child.name.or(parent.name),
        description: child.description.or(parent.description),
        config,
        setup: child.setup.or(parent.setup),
        steps,
        teardown: child.teardown.or(parent.teardown),
    }
}

fn compose_target(record: &Value) -> Option<String> {
    record
        .as_object()?
        .get("compose")?
        .as_str()
        .map(str::to_string)
}

fn with_compose_marker(step: Value, target: &str, params: &Map<String, Value>) -> Value {
    let mut map = match step {
        Value::Object(map) => map,
        Value::String(name) => {
            let mut map = Map::new();
            map.insert(name, Value::Null);
            map
        }
        other => return other,
    };

    // A step already composed one level down keeps its own target and
    // parameters, over the outer ones.
    let mut merged = params.clone();
    let mut marker_target = target.to_string();
    if let Some(Value::Object(inner)) = map.get(COMPOSE_MARKER_KEY) {
        if let Some(Value::Object(inner_params)) = inner.get("params") {
            merged.extend(inner_params.clone());
        }
        if let Some(Value::String(inner_target)) = inner.get("target") {
            marker_target = inner_target.clone();
        }
    }
    map.insert(
        COMPOSE_MARKER_KEY.to_string(),
        json!({"target": marker_target, "params": merged}),
    );
    Value::Object(map)
}

/// Record the file location of `record` and of every step nested in it.
fn annotate(record: &mut Value, path: &Path, pointer: &str) {
    let Some(map) = record.as_object_mut() else {
        return;
    };
    let origin = StepOrigin {
        path: path.to_path_buf(),
        pointer: pointer.to_string(),
    };
    if let Ok(origin) = serde_json::to_value(origin) {
        map.insert(ORIGIN_KEY.to_string(), origin);
    }

    for (key, value) in map.iter_mut() {
        if key == "elif" {
            if let Value::Array(branches) = value {
                for (j, branch) in branches.iter_mut().enumerate() {
                    let Some(branch) = branch.as_object_mut() else {
                        continue;
                    };
                    for (branch_key, list) in branch.iter_mut() {
                        if let Value::Array(list) = list {
                            annotate_list(list, path, &format!("{pointer}/elif/{j}/{branch_key}"));
                        }
                    }
                }
            }
        } else if is_nested_list_key(key) {
            if let Value::Array(list) = value {
                annotate_list(list, path, &format!("{pointer}/{key}"));
            }
        }
    }
}

fn annotate_list(list: &mut [Value], path: &Path, pointer: &str) {
    for (i, item) in list.iter_mut().enumerate() {
        annotate(item, path, &format!("{pointer}/{i}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_order() {
        let resolver = ScriptResolver::new();
        let base = Path::new("/work");
        let candidates = resolver.candidates("login", base);
        assert_eq!(candidates[0], PathBuf::from("/work/login"));
        assert_eq!(candidates[1], PathBuf::from("/work/login.yaml"));
        assert_eq!(candidates[2], PathBuf::from("/work/login.yml"));
        assert_eq!(candidates[3], PathBuf::from("/work/scripts/login"));
        assert_eq!(candidates[6], PathBuf::from("/work/includes/login"));
        assert_eq!(candidates[9], PathBuf::from("/work/lib/login"));
        assert_eq!(candidates.len(), 12);
    }

    #[test]
    fn test_marker_merges_inner_params() {
        let mut outer = Map::new();
        outer.insert("user".into(), json!("ada"));
        outer.insert("role".into(), json!("admin"));
        let step = json!({
            "click": "Go",
            "__compose__": {"target": "inner", "params": {"role": "viewer"}}
        });
        let marked = with_compose_marker(step, "outer", &outer);
        assert_eq!(
            marked["__compose__"],
            json!({"target": "inner", "params": {"user": "ada", "role": "viewer"}})
        );
        let bare = with_compose_marker(json!("go_back"), "outer", &Map::new());
        assert_eq!(bare["go_back"], Value::Null);
    }
}
