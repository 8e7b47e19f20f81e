//! Run artifacts: the last step record, an append-only step log and error records.
//!
//! Writing artifacts never fails a run; problems are logged and the run goes on.

use crate::context::{Phase, StepOutcome};
use crate::repair::ErrorKind;
use crate::snapshot::{ChangeSet, Snapshot};
use chrono::{DateTime, Utc};
use reel::ElementInfo;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const STATE_FILE: &str = "state.json";
pub const STEPS_LOG: &str = "steps.jsonl";
pub const ERROR_FILE: &str = "error.json";
pub const ERRORS_LOG: &str = "errors.jsonl";
pub const REPORT_FILE: &str = "report.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    #[serde(default)]
    pub phase: Phase,
    pub index: usize,
    pub action: String,
    pub step: Value,
    pub location: String,
    /// What the step changed on the surface
    #[serde(default, skip_serializing_if = "ChangeSet::is_empty")]
    pub changes: ChangeSet,
    #[serde(default)]
    pub vars: Map<String, Value>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    #[serde(default)]
    pub phase: Phase,
    pub kind: ErrorKind,
    pub message: String,
    pub step_index: usize,
    pub attempt: u32,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inventory: Vec<ElementInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<StepOutcome>,
    pub recorded_at: DateTime<Utc>,
}

/// Writes artifacts under one directory. A store without a directory writes nothing.
#[derive(Debug, Clone, Default)]
pub struct ArtifactStore {
    dir: Option<PathBuf>,
}

impl ArtifactStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        if let Some(dir) = &dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!("Could not create artifacts directory {}: {}", dir.display(), e);
            }
        }
        Self { dir }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Appends to the step log. Only main steps replace `state.json`, so it
    /// always names a resumable position in `steps`.
    pub fn record_step(&self, record: &StepRecord) {
        let Some(dir) = &self.dir else { return };
        if record.phase == Phase::Steps {
            write_json(&dir.join(STATE_FILE), record);
        }
        append_line(&dir.join(STEPS_LOG), record);
    }

    pub fn record_error(&self, record: &ErrorRecord) {
        let Some(dir) = &self.dir else { return };
        write_json(&dir.join(ERROR_FILE), record);
        append_line(&dir.join(ERRORS_LOG), record);
    }

    pub fn write_report<T: Serialize>(&self, report: &T) {
        let Some(dir) = &self.dir else { return };
        write_json(&dir.join(REPORT_FILE), report);
    }

    /// The last recorded step, used to resume a run.
    pub fn load_state(dir: &Path) -> Option<StepRecord> {
        let path = dir.join(STATE_FILE);
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", path.display(), e);
                None
            }
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) {
    let result = serde_json::to_string_pretty(value)
        .map_err(std::io::Error::from)
        .and_then(|text| std::fs::write(path, text));
    match result {
        Ok(()) => debug!("Wrote {}", path.display()),
        Err(e) => warn!("Failed to write {}: {}", path.display(), e),
    }
}

fn append_line<T: Serialize>(path: &Path, value: &T) {
    let result = serde_json::to_string(value)
        .map_err(std::io::Error::from)
        .and_then(|line| {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{line}")
        });
    if let Err(e) = result {
        warn!("Failed to append to {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(index: usize) -> StepRecord {
        StepRecord {
            phase: Phase::Steps,
            index,
            action: "click".into(),
            step: json!({"click": "Save"}),
            location: "about:blank".into(),
            changes: ChangeSet::new(),
            vars: Map::new(),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_state_is_overwritten_and_log_appended() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(Some(dir.path().to_path_buf()));
        store.record_step(&record(0));
        store.record_step(&record(1));

        let state = ArtifactStore::load_state(dir.path()).unwrap();
        assert_eq!(state.index, 1);
        let log = std::fs::read_to_string(dir.path().join(STEPS_LOG)).unwrap();
        assert_eq!(log.lines().count(), 2);
    }

    #[test]
    fn test_teardown_steps_do_not_replace_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(Some(dir.path().to_path_buf()));
        store.record_step(&record(2));
        store.record_step(&StepRecord {
            phase: Phase::Teardown,
            ..record(0)
        });

        let state = ArtifactStore::load_state(dir.path()).unwrap();
        assert_eq!(state.index, 2);
        assert_eq!(state.phase, Phase::Steps);
        let log = std::fs::read_to_string(dir.path().join(STEPS_LOG)).unwrap();
        assert!(log.lines().last().unwrap().contains("\"teardown\""));
    }

    #[test]
    fn test_store_without_dir_is_silent() {
        let store = ArtifactStore::default();
        store.record_step(&record(0));
        assert!(store.dir().is_none());
    }
}
