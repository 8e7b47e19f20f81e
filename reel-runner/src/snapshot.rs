use chrono::{DateTime, Utc};
use reel::{Backend, Point};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Point-in-time capture of the surface, used for diffing and rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub step_index: Option<usize>,
    pub action: Option<String>,
    pub location: String,
    pub title: String,
    pub cursor: Point,
    pub scroll: Point,
    pub fingerprint: String,
    pub focused: Option<String>,
    pub ready: bool,
    pub captured_at: DateTime<Utc>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            step_index: None,
            action: None,
            location: String::new(),
            title: String::new(),
            cursor: Point::default(),
            scroll: Point::default(),
            fingerprint: String::new(),
            focused: None,
            ready: false,
            captured_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub from: Value,
    pub to: Value,
}

/// Changed fields only, keyed by field name.
pub type ChangeSet = BTreeMap<String, FieldChange>;

fn probe<T: Default>(name: &str, result: Result<T, reel::AutomationError>) -> T {
    result.unwrap_or_else(|e| {
        debug!("Snapshot probe '{}' failed: {}", name, e);
        T::default()
    })
}

impl Snapshot {
    /// Best-effort capture. Each probe degrades to its default on failure.
    pub async fn capture(backend: &dyn Backend) -> Snapshot {
        let (location, title, cursor, scroll, fingerprint, focused, ready) = futures::join!(
            backend.current_location(),
            backend.current_title(),
            backend.cursor_position(),
            backend.scroll_offset(),
            backend.content_fingerprint(),
            backend.focused_target(),
            backend.surface_ready(),
        );
        Snapshot {
            step_index: None,
            action: None,
            location: probe("location", location),
            title: probe("title", title),
            cursor: probe("cursor", cursor),
            scroll: probe("scroll", scroll),
            fingerprint: probe("fingerprint", fingerprint),
            focused: probe("focused", focused),
            ready: probe("ready", ready),
            captured_at: Utc::now(),
        }
    }

    pub fn tagged(mut self, step_index: usize, action: impl Into<String>) -> Snapshot {
        self.step_index = Some(step_index);
        self.action = Some(action.into());
        self
    }

    /// Same fingerprint, location and focus.
    pub fn is_equivalent(&self, other: &Snapshot) -> bool {
        self.fingerprint == other.fingerprint
            && self.location == other.location
            && self.focused == other.focused
    }

    pub fn diff(&self, other: &Snapshot) -> ChangeSet {
        let mut changes = ChangeSet::new();
        let mut compare = |field: &str, from: Value, to: Value| {
            if from != to {
                changes.insert(field.to_string(), FieldChange { from, to });
            }
        };
        compare("location", json!(self.location), json!(other.location));
        compare("title", json!(self.title), json!(other.title));
        compare("cursor", json!(self.cursor), json!(other.cursor));
        compare("scroll", json!(self.scroll), json!(other.scroll));
        compare("fingerprint", json!(self.fingerprint), json!(other.fingerprint));
        compare("focused", json!(self.focused), json!(other.focused));
        compare("ready", json!(self.ready), json!(other.ready));
        changes
    }

    /// The shape exposed to expressions as `state`.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel::SimulatedBackend;

    #[tokio::test]
    async fn test_capture_reads_probes() {
        let backend = SimulatedBackend::new().with_location("https://a.test/");
        let snapshot = Snapshot::capture(&backend).await.tagged(3, "click");
        assert_eq!(snapshot.location, "https://a.test/");
        assert!(snapshot.ready);
        assert!(!snapshot.fingerprint.is_empty());
        assert_eq!(snapshot.step_index, Some(3));
        assert_eq!(snapshot.action.as_deref(), Some("click"));
    }

    #[test]
    fn test_diff_reports_changed_fields_only() {
        let a = Snapshot {
            location: "https://a.test/".into(),
            fingerprint: "aa".into(),
            ..Snapshot::default()
        };
        let mut b = a.clone();
        b.location = "https://b.test/".into();
        b.scroll = Point::new(0.0, 400.0);

        let changes = a.diff(&b);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes["location"].to, json!("https://b.test/"));
        assert!(changes.contains_key("scroll"));
        assert!(!a.is_equivalent(&b));

        let mut c = a.clone();
        c.scroll = Point::new(5.0, 5.0);
        assert!(a.is_equivalent(&c));
        assert!(a.diff(&a).is_empty());
    }
}
