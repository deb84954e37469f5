//! Run orchestration: who spawned whom, when runs finish, and where their
//! results go.
//!
//! - [`tracker`]: in-memory parent/child graph and active/completed partition
//! - [`registry`]: tracker plus durable store behind one lock order
//! - [`monitor`]: background polling that completes runs and forwards results
//! - [`wait`]: poll a single run until it is terminal or a deadline passes
//! - [`service`]: the caller-facing `new`/`resume`/`list` operations

pub mod error;
pub mod monitor;
pub mod registry;
pub mod service;
pub mod tracker;
pub mod wait;

pub use error::EngineError;
pub use monitor::{Completion, CompletionMonitor, MonitorConfig, MonitorReport};
pub use registry::RunRegistry;
pub use service::{
    AgentService, ListParams, ListResponse, NewRunParams, NewRunResponse, ResumeParams,
    ResumeResponse, RunDetails, RunSummary, ServiceConfig,
};
pub use tracker::RelationshipTracker;
pub use wait::wait_for_completion;
