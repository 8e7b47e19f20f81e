//! Backend contract for replaying declarative UI workflow scripts.
//!
//! A [`Backend`] drives some automation surface (a browser session, a desktop
//! window, a simulator) and answers the probes the runner uses to snapshot it.
//! [`SimulatedBackend`] is an in-memory implementation used for dry runs and tests.

pub mod element;
pub mod errors;
pub mod platforms;

pub use element::ElementInfo;
pub use errors::AutomationError;
pub use platforms::simulated::PageModel;
pub use platforms::{
    fingerprint_content, Backend, BackendCall, PageOperation, Point, SimulatedBackend,
    CONTENT_PROBE_SCRIPT,
};
