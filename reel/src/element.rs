use serde::{Deserialize, Serialize};

/// An interactive element reported by a backend.
///
/// Only the properties needed to describe and re-target an element are kept.
/// It cannot perform actions by itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementInfo {
    pub role: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ElementInfo {
    pub fn new(role: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            label: label.into(),
            id: None,
            href: None,
            enabled: true,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_href(mut self, href: impl Into<String>) -> Self {
        self.href = Some(href.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// True when `target` names this element, either by label (case-insensitive) or by id.
    pub fn matches(&self, target: &str) -> bool {
        let target = target.trim();
        if let Some(id) = target.strip_prefix('#') {
            return self.id.as_deref() == Some(id);
        }
        self.label.eq_ignore_ascii_case(target) || self.id.as_deref() == Some(target)
    }
}
