use crate::errors::ScriptError;
use crate::step::{strip_annotations, StepOrigin, COMPOSE_MARKER_KEY};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A script document as written on disk (YAML or JSON).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<Vec<Value>>,
    #[serde(default)]
    pub steps: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown: Option<Vec<Value>>,
}

impl Script {
    pub fn from_yaml(text: &str) -> Result<Script, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Script, ScriptError> {
        let text = read_source(path)?;
        let script = Script::from_yaml(&text).map_err(|e| ScriptError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        debug!(
            "Loaded script {} ({} steps)",
            path.display(),
            script.steps.len()
        );
        Ok(script)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

fn read_source(path: &Path) -> Result<String, ScriptError> {
    std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load any YAML/JSON document as a JSON value.
pub fn load_document(path: &Path) -> Result<Value, ScriptError> {
    let text = read_source(path)?;
    serde_yaml::from_str(&text).map_err(|e| ScriptError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Write `record` over the step at `origin` in its backing file.
/// Runtime-only keys are dropped before writing.
pub fn patch_step(origin: &StepOrigin, record: &Value) -> Result<PathBuf, ScriptError> {
    let path = origin.path.clone();
    let mut document = load_document(&path)?;

    let mut record = record.clone();
    strip_annotations(&mut record);
    if let Some(map) = record.as_object_mut() {
        map.remove(COMPOSE_MARKER_KEY);
    }

    let slot = document
        .pointer_mut(&origin.pointer)
        .ok_or_else(|| ScriptError::Write {
            path: path.clone(),
            message: format!("no step at {}", origin.pointer),
        })?;
    *slot = record;

    let text = serde_yaml::to_string(&document).map_err(|e| ScriptError::Write {
        path: path.clone(),
        message: e.to_string(),
    })?;
    std::fs::write(&path, text).map_err(|e| ScriptError::Write {
        path: path.clone(),
        message: e.to_string(),
    })?;
    info!("Patched step {} in {}", origin.pointer, path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_script_defaults() {
        let script = Script::from_yaml("steps:\n  - click: Save\n").unwrap();
        assert_eq!(script.steps, vec![json!({"click": "Save"})]);
        assert!(script.setup.is_none());
        assert!(script.includes.is_empty());
    }

    #[test]
    fn test_patch_step_rewrites_only_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        std::fs::write(
            &path,
            "name: flow\nsteps:\n  - navigate: https://a.test\n  - action: click_button\n    target: Save\n",
        )
        .unwrap();

        let origin = StepOrigin {
            path: path.clone(),
            pointer: "/steps/1".into(),
        };
        patch_step(
            &origin,
            &json!({"action": "click", "target": "Save", "__compose__": {"target": "x"}}),
        )
        .unwrap();

        let script = Script::load(&path).unwrap();
        assert_eq!(script.name.as_deref(), Some("flow"));
        assert_eq!(script.steps[0], json!({"navigate": "https://a.test"}));
        assert_eq!(script.steps[1], json!({"action": "click", "target": "Save"}));
    }

    #[test]
    fn test_patch_step_reports_missing_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        std::fs::write(&path, "steps: []\n").unwrap();
        let origin = StepOrigin {
            path,
            pointer: "/steps/3".into(),
        };
        assert!(matches!(
            patch_step(&origin, &json!({"click": "x"})),
            Err(ScriptError::Write { .. })
        ));
    }
}
