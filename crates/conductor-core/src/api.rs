use async_trait::async_trait;

use crate::errors::ApiError;
use crate::ids::RunId;
use crate::run::{AgentRun, CreateRunRequest, RunFilter, RunLogs};

/// Operations the tracker needs from the remote agent service.
#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn create_run(&self, request: &CreateRunRequest) -> Result<AgentRun, ApiError>;

    async fn get_run(&self, run_id: &RunId) -> Result<AgentRun, ApiError>;

    /// Continue a run with a follow-up prompt. Used to forward child results to a parent.
    async fn resume_run(&self, run_id: &RunId, prompt: &str) -> Result<AgentRun, ApiError>;

    async fn list_runs(&self, filter: &RunFilter, limit: u32) -> Result<Vec<AgentRun>, ApiError>;

    async fn get_logs(&self, run_id: &RunId, limit: u32) -> Result<RunLogs, ApiError>;
}
