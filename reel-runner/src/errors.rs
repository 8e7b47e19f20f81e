use crate::step::Step;
use reel::AutomationError;
use std::path::PathBuf;
use thiserror::Error;

/// Problems loading, resolving or rewriting a script document.
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Failed to read script {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse script {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Parent script '{reference}' not found from {base}")]
    ParentNotFound { reference: String, base: PathBuf },

    #[error("Inheritance cycle detected at {0}")]
    Cycle(PathBuf),

    #[error("Invalid step at {location}: {message}")]
    InvalidStep { location: String, message: String },

    #[error("Failed to write script {path}: {message}")]
    Write { path: PathBuf, message: String },

    #[error("Invalid runner config: {0}")]
    Config(String),
}

/// Why a single step did not complete.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepFailure {
    #[error(transparent)]
    Backend(#[from] AutomationError),

    #[error("Unknown action '{0}'")]
    UnknownAction(String),

    #[error("Action '{action}' is missing required field '{field}'")]
    MissingField { action: String, field: String },

    #[error("Field '{field}' of action '{action}' expected {expected}, got {actual}")]
    TypeMismatch {
        action: String,
        field: String,
        expected: &'static str,
        actual: String,
    },

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Sub-script '{target}' could not be loaded: {message}")]
    SubScript { target: String, message: String },

    #[error("Invalid step: {0}")]
    InvalidStep(String),
}

impl StepFailure {
    /// Variant name, used when classifying failures by message.
    pub fn kind_name(&self) -> &'static str {
        match self {
            StepFailure::Backend(e) => e.kind_name(),
            StepFailure::UnknownAction(_) => "UnknownAction",
            StepFailure::MissingField { .. } => "MissingField",
            StepFailure::TypeMismatch { .. } => "TypeMismatch",
            StepFailure::AssertionFailed(_) => "AssertionFailed",
            StepFailure::SubScript { .. } => "SubScript",
            StepFailure::InvalidStep(_) => "InvalidStep",
        }
    }
}

/// Outcome of a step that did not produce a snapshot.
#[derive(Error, Debug, Clone)]
pub enum StepError {
    /// The operator skipped the step.
    #[error("step skipped")]
    Skipped,

    /// The operator asked the run to stop.
    #[error("run stopped by operator")]
    Quit,

    /// `step` is the innermost step that failed, which may be nested inside the
    /// step that was being executed.
    #[error("{failure}")]
    Failed { failure: StepFailure, step: Box<Step> },
}

impl StepError {
    pub fn failed(step: &Step, failure: impl Into<StepFailure>) -> Self {
        StepError::Failed {
            failure: failure.into(),
            step: Box::new(step.clone()),
        }
    }
}

/// Failures that prevent a run from starting.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Script(#[from] ScriptError),
}
