use crate::platforms::{fingerprint_content, Backend, PageOperation, Point, CONTENT_PROBE_SCRIPT};
use crate::{AutomationError, ElementInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

const PAGE_HEIGHT: f64 = 10_000.0;

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCall {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub location: String,
}

/// Content of one simulated page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageModel {
    pub title: String,
    pub content: String,
    pub elements: Vec<ElementInfo>,
}

impl PageModel {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_elements(mut self, elements: Vec<ElementInfo>) -> Self {
        self.elements = elements;
        self
    }
}

#[derive(Debug, Default)]
struct SurfaceState {
    location: String,
    back: Vec<String>,
    forward: Vec<String>,
    pages: HashMap<String, PageModel>,
    fallback: PageModel,
    focused: Option<String>,
    scroll: Point,
    cursor: Point,
    values: BTreeMap<String, String>,
    scripts: HashMap<String, Value>,
    calls: Vec<BackendCall>,
    ready: bool,
    screenshots: usize,
}

impl SurfaceState {
    fn page(&self) -> &PageModel {
        self.pages.get(&self.location).unwrap_or(&self.fallback)
    }

    fn record(&mut self, operation: &str, target: Option<&str>, value: Option<&str>) {
        let call = BackendCall {
            operation: operation.to_string(),
            target: target.map(str::to_string),
            value: value.map(str::to_string),
            location: self.location.clone(),
        };
        self.calls.push(call);
    }

    fn go_to(&mut self, url: &str) {
        if !self.location.is_empty() {
            let previous = std::mem::take(&mut self.location);
            self.back.push(previous);
        }
        self.forward.clear();
        self.location = url.to_string();
        self.focused = None;
        self.scroll = Point::default();
    }
}

/// In-memory backend that models a browser-like surface.
///
/// Pages, elements, history, focus, scroll and cursor are tracked so scripts can be
/// replayed without a real UI. In strict mode, actions on unknown elements fail
/// with `ElementNotFound`, which is what the repair loop needs to exercise.
#[derive(Debug)]
pub struct SimulatedBackend {
    state: Mutex<SurfaceState>,
    strict: bool,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SurfaceState {
                location: "about:blank".to_string(),
                ready: true,
                ..Default::default()
            }),
            strict: false,
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_location(mut self, url: impl Into<String>) -> Self {
        self.state_mut().location = url.into();
        self
    }

    /// Elements shown on every page that has no model of its own.
    pub fn with_elements(mut self, elements: Vec<ElementInfo>) -> Self {
        self.state_mut().fallback.elements = elements;
        self
    }

    pub fn with_page(mut self, url: impl Into<String>, page: PageModel) -> Self {
        self.state_mut().pages.insert(url.into(), page);
        self
    }

    /// Fixed result returned when `code` is evaluated.
    pub fn with_script_result(mut self, code: impl Into<String>, result: Value) -> Self {
        self.state_mut().scripts.insert(code.into(), result);
        self
    }

    fn state_mut(&mut self) -> &mut SurfaceState {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<'_, SurfaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }

    /// Calls whose operation matches `operation`.
    pub fn calls_to(&self, operation: &str) -> Vec<BackendCall> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .cloned()
            .collect()
    }

    pub fn location(&self) -> String {
        self.state().location.clone()
    }

    pub fn typed_value(&self, target: &str) -> Option<String> {
        self.state().values.get(target).cloned()
    }

    pub fn set_ready(&self, ready: bool) {
        self.state().ready = ready;
    }

    pub fn set_location(&self, url: &str) {
        self.state().location = url.to_string();
    }

    pub fn set_scroll(&self, offset: Point) {
        self.state().scroll = offset;
    }

    pub fn add_element(&self, element: ElementInfo) {
        let mut guard = self.state();
        let state = &mut *guard;
        match state.pages.get_mut(&state.location) {
            Some(page) => page.elements.push(element),
            None => state.fallback.elements.push(element),
        }
    }

    fn resolve_element(
        &self,
        state: &SurfaceState,
        target: &str,
    ) -> Result<Option<ElementInfo>, AutomationError> {
        let found = state
            .page()
            .elements
            .iter()
            .find(|element| element.matches(target))
            .cloned();
        match found {
            Some(element) if !element.enabled && self.strict => {
                Err(AutomationError::ElementNotEnabled(target.to_string()))
            }
            Some(element) => Ok(Some(element)),
            None if self.strict => Err(AutomationError::ElementNotFound(format!(
                "no element matching '{target}' on {}",
                state.location
            ))),
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl Backend for SimulatedBackend {
    async fn click(&self, target: &str) -> Result<(), AutomationError> {
        let mut state = self.state();
        state.record("click", Some(target), None);
        let element = self.resolve_element(&state, target)?;
        state.focused = Some(target.to_string());
        if let Some(href) = element.and_then(|e| e.href) {
            debug!("Simulated click on '{}' follows link to {}", target, href);
            state.go_to(&href);
        }
        Ok(())
    }

    async fn hover(&self, target: &str) -> Result<(), AutomationError> {
        let mut state = self.state();
        state.record("hover", Some(target), None);
        self.resolve_element(&state, target)?;
        Ok(())
    }

    async fn type_text(&self, target: &str, text: &str) -> Result<(), AutomationError> {
        let mut state = self.state();
        state.record("type", Some(target), Some(text));
        self.resolve_element(&state, target)?;
        state.focused = Some(target.to_string());
        state.values.insert(target.to_string(), text.to_string());
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), AutomationError> {
        let mut state = self.state();
        state.record("navigate", None, Some(url));
        if url.trim().is_empty() {
            return Err(AutomationError::NavigationFailed(
                "empty url".to_string(),
            ));
        }
        state.go_to(url);
        Ok(())
    }

    async fn evaluate(&self, code: &str) -> Result<Value, AutomationError> {
        let mut state = self.state();
        state.record("evaluate", None, Some(code));
        if let Some(result) = state.scripts.get(code) {
            return Ok(result.clone());
        }
        let result = match code.trim() {
            CONTENT_PROBE_SCRIPT => Value::String(state.page().content.clone()),
            "document.title" => Value::String(state.page().title.clone()),
            "location.href" | "window.location.href" => Value::String(state.location.clone()),
            _ => Value::Null,
        };
        Ok(result)
    }

    async fn screenshot(&self, name: &str) -> Result<String, AutomationError> {
        let mut state = self.state();
        state.record("screenshot", None, Some(name));
        state.screenshots += 1;
        Ok(format!("memory://screenshots/{}-{}.png", state.screenshots, name))
    }

    async fn perform(&self, operation: PageOperation) -> Result<(), AutomationError> {
        let mut state = self.state();
        state.record(operation.name(), None, None);
        match operation {
            PageOperation::GoBack => {
                if let Some(previous) = state.back.pop() {
                    let current = std::mem::replace(&mut state.location, previous);
                    state.forward.push(current);
                }
            }
            PageOperation::GoForward => {
                if let Some(next) = state.forward.pop() {
                    let current = std::mem::replace(&mut state.location, next);
                    state.back.push(current);
                }
            }
            PageOperation::Reload => state.scroll = Point::default(),
            PageOperation::ScrollTop => state.scroll.y = 0.0,
            PageOperation::ScrollBottom => state.scroll.y = PAGE_HEIGHT,
            PageOperation::PressEnter | PageOperation::PressEscape => {}
        }
        Ok(())
    }

    async fn scroll_to(&self, offset: Point) -> Result<(), AutomationError> {
        let mut state = self.state();
        let value = format!("{},{}", offset.x, offset.y);
        state.record("scroll_to", None, Some(&value));
        state.scroll = Point::new(offset.x.max(0.0), offset.y.clamp(0.0, PAGE_HEIGHT));
        Ok(())
    }

    async fn move_cursor(&self, position: Point) -> Result<(), AutomationError> {
        let mut state = self.state();
        state.cursor = position;
        Ok(())
    }

    async fn current_location(&self) -> Result<String, AutomationError> {
        Ok(self.state().location.clone())
    }

    async fn current_title(&self) -> Result<String, AutomationError> {
        let state = self.state();
        let title = &state.page().title;
        if title.is_empty() {
            Ok(state.location.clone())
        } else {
            Ok(title.clone())
        }
    }

    async fn scroll_offset(&self) -> Result<Point, AutomationError> {
        Ok(self.state().scroll)
    }

    async fn cursor_position(&self) -> Result<Point, AutomationError> {
        Ok(self.state().cursor)
    }

    async fn focused_target(&self) -> Result<Option<String>, AutomationError> {
        Ok(self.state().focused.clone())
    }

    async fn surface_ready(&self) -> Result<bool, AutomationError> {
        Ok(self.state().ready)
    }

    async fn content_fingerprint(&self) -> Result<String, AutomationError> {
        let state = self.state();
        let mut content = format!("{}\n{}", state.location, state.page().content);
        for (target, value) in &state.values {
            content.push_str(&format!("\n{target}={value}"));
        }
        Ok(fingerprint_content(&content))
    }

    async fn interactive_elements(&self) -> Result<Vec<ElementInfo>, AutomationError> {
        Ok(self.state().page().elements.clone())
    }
}
