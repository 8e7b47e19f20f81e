use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AutomationError {
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Script evaluation failed: {0}")]
    ScriptFailed(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Element is not enabled: {0}")]
    ElementNotEnabled(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AutomationError {
    /// Short variant name, used when classifying failures by message.
    pub fn kind_name(&self) -> &'static str {
        match self {
            AutomationError::ElementNotFound(_) => "ElementNotFound",
            AutomationError::Timeout(_) => "Timeout",
            AutomationError::NavigationFailed(_) => "NavigationFailed",
            AutomationError::ScriptFailed(_) => "ScriptFailed",
            AutomationError::UnsupportedOperation(_) => "UnsupportedOperation",
            AutomationError::InvalidArgument(_) => "InvalidArgument",
            AutomationError::ElementNotEnabled(_) => "ElementNotEnabled",
            AutomationError::SessionClosed(_) => "SessionClosed",
            AutomationError::Internal(_) => "Internal",
        }
    }

    /// Whether retrying the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AutomationError::ElementNotFound(_)
                | AutomationError::Timeout(_)
                | AutomationError::ElementNotEnabled(_)
                | AutomationError::NavigationFailed(_)
        )
    }
}
