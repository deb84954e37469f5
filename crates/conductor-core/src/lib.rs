pub mod api;
pub mod errors;
pub mod ids;
pub mod run;
pub mod status;

pub use api::AgentApi;
pub use errors::ApiError;
pub use ids::RunId;
pub use run::{AgentRun, CreateRunRequest, LogEntry, RunFilter, RunLogs};
pub use status::{OrchestratorStatus, RunStatus};
