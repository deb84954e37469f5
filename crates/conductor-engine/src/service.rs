use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use conductor_core::api::AgentApi;
use conductor_core::ids::RunId;
use conductor_core::run::{AgentRun, CreateRunRequest, RunFilter, RunLogs};
use conductor_core::status::RunStatus;
use conductor_store::records::Metadata;
use conductor_store::RunRecord;

use crate::error::EngineError;
use crate::monitor::CompletionMonitor;
use crate::registry::RunRegistry;
use crate::wait::wait_for_completion;

const DEFAULT_LIST_LIMIT: u32 = 10;
const DEFAULT_LOG_LIMIT: u32 = 100;

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub wait_timeout: Duration,
    pub wait_poll_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(600),
            wait_poll_interval: Duration::from_secs(5),
        }
    }
}

// ── Parameters and responses ────────────────────────────────────────

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewRunParams {
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    pub query: String,
    #[serde(default)]
    pub parent_id: Option<RunId>,
    #[serde(default)]
    pub wait_for_completion: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct NewRunResponse {
    pub success: bool,
    pub agent_run_id: RunId,
    pub status: String,
    pub web_url: Option<String>,
    pub message: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ResumeParams {
    pub agent_run_id: RunId,
    pub query: String,
    #[serde(default)]
    pub wait_for_completion: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResumeResponse {
    pub success: bool,
    pub status: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub repo: Option<String>,
}

/// A remote run plus what this process knows about it locally.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub id: RunId,
    pub status: String,
    pub web_url: Option<String>,
    pub created_at: Option<String>,
    pub summary: Option<String>,
    pub parent_id: Option<RunId>,
    pub child_count: usize,
    pub local_status: Option<RunStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ListResponse {
    pub runs: Vec<RunSummary>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunDetails {
    pub run: AgentRun,
    pub local: Option<RunRecord>,
    pub parent_id: Option<RunId>,
    pub children: Vec<RunId>,
}

// ── Service ─────────────────────────────────────────────────────────

/// Caller-facing operations over the remote API and the local registry.
pub struct AgentService {
    api: Arc<dyn AgentApi>,
    registry: Arc<RunRegistry>,
    monitor: Arc<CompletionMonitor>,
    config: ServiceConfig,
}

impl AgentService {
    pub fn new(
        api: Arc<dyn AgentApi>,
        registry: Arc<RunRegistry>,
        monitor: Arc<CompletionMonitor>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            api,
            registry,
            monitor,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<CompletionMonitor> {
        &self.monitor
    }

    /// Start a run. Local state is only written once the remote accepted it.
    #[instrument(skip_all, fields(parent_id = ?params.parent_id, wait = params.wait_for_completion))]
    pub async fn new_run(&self, params: NewRunParams) -> Result<NewRunResponse, EngineError> {
        let query = non_empty(&params.query, "query")?;
        let request = CreateRunRequest {
            prompt: build_prompt(params.repo.as_deref(), params.task.as_deref(), query),
            metadata: run_metadata(&params),
        };

        let run = self.api.create_run(&request).await?;
        info!(run_id = %run.id, "agent run created");

        let registered = match &params.parent_id {
            Some(parent) => {
                self.registry
                    .register_parent_child(parent, &run.id, Some(request.metadata.clone()))
            }
            None => self
                .registry
                .register_run(&run.id, Some(request.metadata.clone()))
                .map(|_| ()),
        };
        let mut message = match &params.parent_id {
            Some(parent) => format!("Agent run {} started as a child of {parent}", run.id),
            None => format!("Agent run {} started", run.id),
        };
        if let Err(e) = registered {
            error!(run_id = %run.id, error = %e, "failed to persist new run");
            message.push_str(&format!(" (local state not persisted: {e})"));
        }

        if !params.wait_for_completion {
            return Ok(NewRunResponse {
                success: true,
                agent_run_id: run.id,
                status: run.status,
                web_url: run.web_url,
                message,
            });
        }

        let web_url = run.web_url.clone();
        let observed = match self.wait_and_settle(&run.id, None).await {
            Ok(observed) => observed,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "wait after create failed");
                return Ok(NewRunResponse {
                    success: true,
                    agent_run_id: run.id,
                    status: run.status,
                    web_url,
                    message: format!("{message}; waiting failed: {e}"),
                });
            }
        };
        Ok(NewRunResponse {
            success: succeeded(&observed),
            message: outcome_message(&observed, self.config.wait_timeout),
            agent_run_id: observed.id,
            status: observed.status,
            web_url: observed.web_url.or(web_url),
        })
    }

    /// Send a follow-up prompt to an existing run.
    ///
    /// An unknown run is registered as running. A run that is terminal
    /// locally stays terminal.
    #[instrument(skip_all, fields(run_id = %params.agent_run_id, wait = params.wait_for_completion))]
    pub async fn resume(&self, params: ResumeParams) -> Result<ResumeResponse, EngineError> {
        let query = non_empty(&params.query, "query")?;
        let run_id = params.agent_run_id;

        let run = self.api.resume_run(&run_id, query).await?;
        match self.registry.register_run(&run_id, None) {
            Ok(true) => info!("registered previously unknown run"),
            Ok(false) => {}
            Err(e) => error!(error = %e, "failed to persist resumed run"),
        }

        if !params.wait_for_completion {
            return Ok(ResumeResponse {
                success: true,
                status: run.status,
                message: format!("Agent run {run_id} resumed"),
            });
        }

        let observed = self.wait_and_settle(&run_id, None).await?;
        Ok(ResumeResponse {
            success: succeeded(&observed),
            message: outcome_message(&observed, self.config.wait_timeout),
            status: observed.status,
        })
    }

    /// List remote runs, annotated with local parent and child information.
    pub async fn list(&self, params: ListParams) -> Result<ListResponse, EngineError> {
        let filter = RunFilter {
            status: params.status,
            repo: params.repo,
        };
        let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1);
        let remote = self.api.list_runs(&filter, limit).await?;

        let runs = remote
            .into_iter()
            .map(|run| RunSummary {
                parent_id: self.registry.parent_of(&run.id),
                child_count: self.registry.children_of(&run.id).len(),
                local_status: self.registry.get_run(&run.id).map(|r| r.status),
                id: run.id,
                status: run.status,
                web_url: run.web_url,
                created_at: run.created_at,
                summary: run.summary,
            })
            .collect();
        Ok(ListResponse { runs })
    }

    pub async fn get(&self, run_id: &RunId) -> Result<RunDetails, EngineError> {
        let run = self.api.get_run(run_id).await?;
        Ok(RunDetails {
            local: self.registry.get_run(run_id),
            parent_id: self.registry.parent_of(run_id),
            children: self.registry.children_of(run_id),
            run,
        })
    }

    pub async fn logs(&self, run_id: &RunId, limit: Option<u32>) -> Result<RunLogs, EngineError> {
        let limit = limit.unwrap_or(DEFAULT_LOG_LIMIT).max(1);
        Ok(self.api.get_logs(run_id, limit).await?)
    }

    /// Block until `run_id` is terminal or the timeout elapses.
    pub async fn wait(&self, run_id: &RunId, timeout: Option<Duration>) -> Result<AgentRun, EngineError> {
        self.wait_and_settle(run_id, timeout).await
    }

    /// Wait, then route a terminal result through the monitor so a locally
    /// tracked run completes (and forwards) exactly as a monitor pass would.
    async fn wait_and_settle(
        &self,
        run_id: &RunId,
        timeout: Option<Duration>,
    ) -> Result<AgentRun, EngineError> {
        let run = wait_for_completion(
            self.api.as_ref(),
            run_id,
            timeout.unwrap_or(self.config.wait_timeout),
            self.config.wait_poll_interval,
        )
        .await?;

        if run.is_terminal() && self.registry.is_active(run_id) {
            if let Err(e) = self.monitor.handle_completed_run(&run).await {
                warn!(run_id = %run_id, error = %e, "failed to forward result after wait");
            }
        }
        Ok(run)
    }
}

fn non_empty<'a>(value: &'a str, field: &str) -> Result<&'a str, EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidInput(format!("`{field}` must not be empty")));
    }
    Ok(trimmed)
}

fn build_prompt(repo: Option<&str>, task: Option<&str>, query: &str) -> String {
    let mut sections = Vec::with_capacity(3);
    if let Some(repo) = repo.filter(|r| !r.trim().is_empty()) {
        sections.push(format!("Repository: {}", repo.trim()));
    }
    if let Some(task) = task.filter(|t| !t.trim().is_empty()) {
        sections.push(format!("Task: {}", task.trim()));
    }
    sections.push(query.to_string());
    sections.join("\n\n")
}

fn run_metadata(params: &NewRunParams) -> Metadata {
    let mut metadata = Metadata::new();
    if let Some(repo) = &params.repo {
        let _ = metadata.insert("repo".into(), repo.clone().into());
    }
    if let Some(task) = &params.task {
        let _ = metadata.insert("task".into(), task.clone().into());
    }
    if let Some(parent) = &params.parent_id {
        let _ = metadata.insert("parent_id".into(), parent.to_string().into());
    }
    metadata
}

fn succeeded(run: &AgentRun) -> bool {
    !matches!(run.run_status(), RunStatus::Failed | RunStatus::Cancelled)
}

fn outcome_message(run: &AgentRun, timeout: Duration) -> String {
    if run.is_terminal() {
        format!("Agent run {} finished with status {}", run.id, run.status)
    } else {
        format!(
            "Agent run {} still {} after waiting {}s",
            run.id,
            run.status,
            timeout.as_secs()
        )
    }
}
