use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use conductor_core::api::AgentApi;
use conductor_core::errors::ApiError;
use conductor_core::ids::RunId;
use conductor_core::run::{AgentRun, CreateRunRequest, RunFilter, RunLogs};

const FIRST_MOCK_ID: u64 = 1000;

/// In-memory stand-in for the remote service, for deterministic tests.
///
/// Runs are kept in a map; tests flip statuses with [`MockAgentApi::set_status`]
/// or queue a status sequence with [`MockAgentApi::script_statuses`].
/// Every create and resume call is recorded for later assertions.
#[derive(Default)]
pub struct MockAgentApi {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    runs: BTreeMap<RunId, AgentRun>,
    next_id: u64,
    scripted: HashMap<RunId, VecDeque<String>>,
    get_failures: HashMap<RunId, VecDeque<ApiError>>,
    create_failure: Option<ApiError>,
    resume_failure: Option<ApiError>,
    created: Vec<CreateRunRequest>,
    resumes: Vec<(RunId, String)>,
    logs: HashMap<RunId, RunLogs>,
    get_calls: usize,
}

impl MockAgentApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a run as if the service already knew it.
    pub fn insert_run(&self, run: AgentRun) {
        self.state.lock().runs.insert(run.id.clone(), run);
    }

    pub fn set_status(&self, run_id: &RunId, status: &str, result: Option<&str>) {
        let mut state = self.state.lock();
        let run = state
            .runs
            .entry(run_id.clone())
            .or_insert_with(|| AgentRun::new(run_id.clone(), status));
        run.status = status.to_string();
        run.result = result.map(str::to_string);
    }

    /// Each subsequent `get_run` pops the next status; the last one sticks.
    pub fn script_statuses(&self, run_id: &RunId, statuses: &[&str]) {
        self.state.lock().scripted.insert(
            run_id.clone(),
            statuses.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Queue errors returned by the next `get_run` calls for this run.
    pub fn fail_get(&self, run_id: &RunId, errors: Vec<ApiError>) {
        self.state
            .lock()
            .get_failures
            .insert(run_id.clone(), errors.into());
    }

    /// Fail the next `create_run` call.
    pub fn fail_create(&self, error: ApiError) {
        self.state.lock().create_failure = Some(error);
    }

    /// Fail the next `resume_run` call.
    pub fn fail_resume(&self, error: ApiError) {
        self.state.lock().resume_failure = Some(error);
    }

    pub fn set_logs(&self, run_id: &RunId, logs: RunLogs) {
        self.state.lock().logs.insert(run_id.clone(), logs);
    }

    pub fn created(&self) -> Vec<CreateRunRequest> {
        self.state.lock().created.clone()
    }

    pub fn resumes(&self) -> Vec<(RunId, String)> {
        self.state.lock().resumes.clone()
    }

    pub fn get_calls(&self) -> usize {
        self.state.lock().get_calls
    }
}

#[async_trait]
impl AgentApi for MockAgentApi {
    async fn create_run(&self, request: &CreateRunRequest) -> Result<AgentRun, ApiError> {
        let mut state = self.state.lock();
        if let Some(e) = state.create_failure.take() {
            return Err(e);
        }

        let id = RunId::from(FIRST_MOCK_ID + state.next_id);
        state.next_id += 1;

        let mut run = AgentRun::new(id.clone(), "ACTIVE")
            .with_web_url(format!("https://mock.invalid/runs/{id}"));
        if !request.metadata.is_empty() {
            run.metadata = Some(serde_json::Value::Object(request.metadata.clone()));
        }
        state.created.push(request.clone());
        state.runs.insert(id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: &RunId) -> Result<AgentRun, ApiError> {
        let mut state = self.state.lock();
        state.get_calls += 1;

        if let Some(e) = state.get_failures.get_mut(run_id).and_then(VecDeque::pop_front) {
            return Err(e);
        }

        let next_status = match state.scripted.get_mut(run_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };

        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| ApiError::NotFound(format!("agent run {run_id}")))?;
        if let Some(status) = next_status {
            run.status = status;
        }
        Ok(run.clone())
    }

    async fn resume_run(&self, run_id: &RunId, prompt: &str) -> Result<AgentRun, ApiError> {
        let mut state = self.state.lock();
        if let Some(e) = state.resume_failure.take() {
            return Err(e);
        }

        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| ApiError::NotFound(format!("agent run {run_id}")))?;
        run.status = "ACTIVE".to_string();
        let run = run.clone();
        state.resumes.push((run_id.clone(), prompt.to_string()));
        Ok(run)
    }

    async fn list_runs(&self, filter: &RunFilter, limit: u32) -> Result<Vec<AgentRun>, ApiError> {
        let state = self.state.lock();
        let runs = state
            .runs
            .values()
            .rev()
            .filter(|run| match &filter.status {
                Some(status) => run.status.eq_ignore_ascii_case(status),
                None => true,
            })
            .filter(|run| match &filter.repo {
                Some(repo) => run
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("repo"))
                    .and_then(|v| v.as_str())
                    == Some(repo.as_str()),
                None => true,
            })
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(runs)
    }

    async fn get_logs(&self, run_id: &RunId, limit: u32) -> Result<RunLogs, ApiError> {
        let state = self.state.lock();
        if !state.runs.contains_key(run_id) {
            return Err(ApiError::NotFound(format!("agent run {run_id}")));
        }
        let mut logs = state.logs.get(run_id).cloned().unwrap_or_default();
        logs.logs.truncate(limit as usize);
        Ok(logs)
    }
}
