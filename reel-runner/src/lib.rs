//! Script engine for declarative UI workflows.
//!
//! A script is resolved (inheritance, includes, composition) into a flat list of
//! steps, then interpreted against a [`reel::Backend`]. Every top-level step runs
//! inside a retry loop that classifies failures, patches the step's source with a
//! heuristic fix and rolls the surface back before trying again.

pub mod actions;
pub mod artifacts;
pub mod config;
pub mod context;
pub mod control;
pub mod duration_parser;
pub mod errors;
pub mod event_bus;
pub mod executor;
pub mod expression_eval;
mod healing;
pub mod helpers;
pub mod reload;
pub mod repair;
pub mod resolver;
pub mod runner;
pub mod script;
pub mod snapshot;
pub mod step;
pub mod utils;

pub use actions::{ActionHandler, ActionRegistry};
pub use config::{ConfigOverrides, RunnerConfig};
pub use context::{ExecutionContext, Phase};
pub use control::{control_channel, ControlChannel, ControlHandle, OperatorCommand};
pub use errors::{RunError, ScriptError, StepError, StepFailure};
pub use executor::Executor;
pub use repair::{ErrorKind, FixResult, HeuristicRepair, NoRepair, RepairStrategy};
pub use resolver::{FlatScript, ScriptResolver};
pub use runner::{RunReport, RunStatus, ScriptRunner};
pub use script::Script;
pub use snapshot::Snapshot;
pub use step::{Step, StepKind};
