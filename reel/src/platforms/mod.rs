use crate::{AutomationError, ElementInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub mod simulated;

pub use simulated::{BackendCall, SimulatedBackend};

/// Probe evaluated by the default `content_fingerprint` implementation.
pub const CONTENT_PROBE_SCRIPT: &str = "document.body ? document.body.innerText : ''";

/// A position on the surface, used for both the cursor and the scroll offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Page-level operations that take no arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageOperation {
    GoBack,
    GoForward,
    Reload,
    ScrollTop,
    ScrollBottom,
    PressEnter,
    PressEscape,
}

impl PageOperation {
    pub const ALL: [PageOperation; 7] = [
        PageOperation::GoBack,
        PageOperation::GoForward,
        PageOperation::Reload,
        PageOperation::ScrollTop,
        PageOperation::ScrollBottom,
        PageOperation::PressEnter,
        PageOperation::PressEscape,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PageOperation::GoBack => "go_back",
            PageOperation::GoForward => "go_forward",
            PageOperation::Reload => "reload",
            PageOperation::ScrollTop => "scroll_top",
            PageOperation::ScrollBottom => "scroll_bottom",
            PageOperation::PressEnter => "press_enter",
            PageOperation::PressEscape => "press_escape",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }
}

impl fmt::Display for PageOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hash page content into the fingerprint stored in snapshots.
pub fn fingerprint_content(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// The contract every automation backend must implement.
///
/// Actions drive the surface; probes report on it. Probes are expected to be
/// cheap, and callers treat a failed probe as "unknown" rather than fatal.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Click the element named by `target`
    async fn click(&self, target: &str) -> Result<(), AutomationError>;

    /// Rest the pointer over the element named by `target`.
    /// Default implementation returns an UnsupportedOperation error.
    async fn hover(&self, target: &str) -> Result<(), AutomationError> {
        Err(AutomationError::UnsupportedOperation(format!(
            "hover over '{target}' not implemented for this backend"
        )))
    }

    /// Type `text` into the element named by `target`
    async fn type_text(&self, target: &str, text: &str) -> Result<(), AutomationError>;

    async fn navigate(&self, url: &str) -> Result<(), AutomationError>;

    /// Evaluate backend-native code and return its JSON result
    async fn evaluate(&self, code: &str) -> Result<Value, AutomationError>;

    /// Capture a screenshot and return where it was stored
    async fn screenshot(&self, name: &str) -> Result<String, AutomationError>;

    async fn perform(&self, operation: PageOperation) -> Result<(), AutomationError>;

    async fn scroll_to(&self, offset: Point) -> Result<(), AutomationError>;

    /// Move the pointer. Backends without a pointer may ignore this.
    async fn move_cursor(&self, _position: Point) -> Result<(), AutomationError> {
        Ok(())
    }

    async fn current_location(&self) -> Result<String, AutomationError>;

    async fn current_title(&self) -> Result<String, AutomationError>;

    async fn scroll_offset(&self) -> Result<Point, AutomationError>;

    async fn cursor_position(&self) -> Result<Point, AutomationError> {
        Ok(Point::default())
    }

    /// Label or id of the focused element, if any
    async fn focused_target(&self) -> Result<Option<String>, AutomationError>;

    /// True once the surface has finished loading and can accept input
    async fn surface_ready(&self) -> Result<bool, AutomationError>;

    /// Stable hash of the page content.
    /// Default implementation evaluates `CONTENT_PROBE_SCRIPT` and hashes the result.
    async fn content_fingerprint(&self) -> Result<String, AutomationError> {
        let content = self.evaluate(CONTENT_PROBE_SCRIPT).await?;
        let text = match content {
            Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(fingerprint_content(&text))
    }

    /// Interactive elements currently on the surface, in document order.
    /// Default implementation returns an UnsupportedOperation error.
    async fn interactive_elements(&self) -> Result<Vec<ElementInfo>, AutomationError> {
        Err(AutomationError::UnsupportedOperation(
            "interactive_elements not implemented for this backend".to_string(),
        ))
    }
}
