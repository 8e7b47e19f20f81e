use crate::duration_parser::as_millis;
use crate::errors::ScriptError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

/// Runner settings. Layered as defaults, then the script's `config.runner`
/// block, then command-line overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub max_attempts: u32,
    #[serde(with = "as_millis")]
    pub action_timeout: Duration,
    #[serde(with = "as_millis")]
    pub ready_timeout: Duration,
    #[serde(with = "as_millis")]
    pub ready_poll_interval: Duration,
    /// Minimum wall-clock duration of a `static: true` step
    #[serde(with = "as_millis")]
    pub static_min_duration: Duration,
    /// Step outcomes kept for error records
    pub history_len: usize,
    /// Inventory entries kept for error records
    pub inventory_limit: usize,
    pub persist_repairs: bool,
    pub artifacts_dir: Option<PathBuf>,
    pub script_dirs: Vec<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            action_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(10),
            ready_poll_interval: Duration::from_millis(100),
            static_min_duration: Duration::from_millis(1500),
            history_len: 10,
            inventory_limit: 200,
            persist_repairs: true,
            artifacts_dir: None,
            script_dirs: Vec::new(),
        }
    }
}

impl RunnerConfig {
    /// Apply the `runner` entry of a script's `config` block, if any.
    pub fn overlay(&self, script_config: &Map<String, Value>) -> Result<RunnerConfig, ScriptError> {
        let Some(block) = script_config.get("runner") else {
            return Ok(self.clone());
        };
        let block = block
            .as_object()
            .ok_or_else(|| ScriptError::Config("config.runner must be a mapping".to_string()))?;

        let mut merged = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(e) => return Err(ScriptError::Config(e.to_string())),
        };
        merged.extend(block.clone());
        let config: RunnerConfig = serde_json::from_value(Value::Object(merged))
            .map_err(|e| ScriptError::Config(e.to_string()))?;
        Ok(config.sanitized())
    }

    fn sanitized(mut self) -> Self {
        self.max_attempts = self.max_attempts.max(1);
        if self.ready_poll_interval.is_zero() {
            self.ready_poll_interval = Duration::from_millis(10);
        }
        self
    }
}

/// Settings given on the command line or through the environment. They win
/// over everything the script says.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub max_attempts: Option<u32>,
    pub artifacts_dir: Option<PathBuf>,
    pub action_timeout: Option<Duration>,
}

impl ConfigOverrides {
    pub fn apply(&self, mut config: RunnerConfig) -> RunnerConfig {
        if let Some(max_attempts) = self.max_attempts {
            config.max_attempts = max_attempts.max(1);
        }
        if let Some(dir) = &self.artifacts_dir {
            config.artifacts_dir = Some(dir.clone());
        }
        if let Some(timeout) = self.action_timeout {
            config.action_timeout = timeout;
        }
        config
    }
}
