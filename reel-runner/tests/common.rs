#![allow(dead_code)]

use async_trait::async_trait;
use reel::{AutomationError, Backend, ElementInfo, PageOperation, Point, SimulatedBackend};
use reel_runner::RunnerConfig;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Runner settings that keep tests fast.
pub fn fast_config() -> RunnerConfig {
    RunnerConfig {
        max_attempts: 3,
        action_timeout: Duration::from_secs(5),
        ready_timeout: Duration::from_millis(200),
        ready_poll_interval: Duration::from_millis(10),
        static_min_duration: Duration::from_millis(300),
        ..RunnerConfig::default()
    }
}

pub fn write_script(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write test script");
    path
}

enum Injected {
    Times(usize, AutomationError),
    Always(AutomationError),
}

/// Wraps the simulated backend and fails chosen operations on demand.
/// Every call to a driven operation is counted, failed or not.
pub struct FlakyBackend {
    pub inner: SimulatedBackend,
    injected: Mutex<HashMap<String, Injected>>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl FlakyBackend {
    pub fn new(inner: SimulatedBackend) -> Self {
        Self {
            inner,
            injected: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail_times(self, operation: &str, times: usize, error: AutomationError) -> Self {
        self.injected
            .lock()
            .unwrap()
            .insert(operation.to_string(), Injected::Times(times, error));
        self
    }

    pub fn fail_always(self, operation: &str, error: AutomationError) -> Self {
        self.injected
            .lock()
            .unwrap()
            .insert(operation.to_string(), Injected::Always(error));
        self
    }

    pub fn attempts(&self, operation: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    fn check(&self, operation: &str) -> Result<(), AutomationError> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_insert(0) += 1;

        let mut injected = self.injected.lock().unwrap();
        match injected.get_mut(operation) {
            Some(Injected::Always(error)) => Err(error.clone()),
            Some(Injected::Times(remaining, error)) if *remaining > 0 => {
                *remaining -= 1;
                Err(error.clone())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for FlakyBackend {
    async fn click(&self, target: &str) -> Result<(), AutomationError> {
        self.check("click")?;
        self.inner.click(target).await
    }

    async fn hover(&self, target: &str) -> Result<(), AutomationError> {
        self.check("hover")?;
        self.inner.hover(target).await
    }

    async fn type_text(&self, target: &str, text: &str) -> Result<(), AutomationError> {
        self.check("type")?;
        self.inner.type_text(target, text).await
    }

    async fn navigate(&self, url: &str) -> Result<(), AutomationError> {
        self.check("navigate")?;
        self.inner.navigate(url).await
    }

    async fn evaluate(&self, code: &str) -> Result<Value, AutomationError> {
        self.check("evaluate")?;
        self.inner.evaluate(code).await
    }

    async fn screenshot(&self, name: &str) -> Result<String, AutomationError> {
        self.check("screenshot")?;
        self.inner.screenshot(name).await
    }

    async fn perform(&self, operation: PageOperation) -> Result<(), AutomationError> {
        self.check(operation.name())?;
        self.inner.perform(operation).await
    }

    async fn scroll_to(&self, offset: Point) -> Result<(), AutomationError> {
        self.check("scroll_to")?;
        self.inner.scroll_to(offset).await
    }

    async fn move_cursor(&self, position: Point) -> Result<(), AutomationError> {
        self.inner.move_cursor(position).await
    }

    async fn current_location(&self) -> Result<String, AutomationError> {
        self.inner.current_location().await
    }

    async fn current_title(&self) -> Result<String, AutomationError> {
        self.inner.current_title().await
    }

    async fn scroll_offset(&self) -> Result<Point, AutomationError> {
        self.inner.scroll_offset().await
    }

    async fn cursor_position(&self) -> Result<Point, AutomationError> {
        self.inner.cursor_position().await
    }

    async fn focused_target(&self) -> Result<Option<String>, AutomationError> {
        self.inner.focused_target().await
    }

    async fn surface_ready(&self) -> Result<bool, AutomationError> {
        self.inner.surface_ready().await
    }

    async fn content_fingerprint(&self) -> Result<String, AutomationError> {
        self.inner.content_fingerprint().await
    }

    async fn interactive_elements(&self) -> Result<Vec<ElementInfo>, AutomationError> {
        self.inner.interactive_elements().await
    }
}
