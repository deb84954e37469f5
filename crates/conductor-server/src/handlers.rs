//! RPC method handlers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;

use conductor_core::ids::RunId;
use conductor_engine::service::{ListParams, NewRunParams, ResumeParams};
use conductor_engine::AgentService;

use crate::compat;
use crate::rpc::{self, RpcResponse};

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub service: Arc<AgentService>,
    pub started_at: Instant,
}

impl HandlerState {
    pub fn new(service: Arc<AgentService>) -> Self {
        Self {
            service,
            started_at: Instant::now(),
        }
    }
}

#[derive(Deserialize)]
struct RunIdParams {
    run_id: RunId,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct OrchestratorIdParams {
    orchestrator_id: RunId,
}

/// Dispatch an RPC method to its handler.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let params = compat::normalize_params(params);

    match method {
        // Agent runs (remote)
        "agent.new" => agent_new(state, &params, id).await,
        "agent.resume" => agent_resume(state, &params, id).await,
        "agent.list" => agent_list(state, &params, id).await,
        "agent.get" => agent_get(state, &params, id).await,
        "agent.logs" => agent_logs(state, &params, id).await,
        "agent.wait" => agent_wait(state, &params, id).await,

        // Local state
        "orchestrator.get" => orchestrator_get(state, &params, id),
        "orchestrator.list" => orchestrator_list(state, id),
        "run.get" => run_get(state, &params, id),

        // System
        "system.ping" | "health" => health(state, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

// ── Agent ───────────────────────────────────────────────────────────

async fn agent_new(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let params: NewRunParams = match rpc::parse_params(params) {
        Ok(p) => p,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.service.new_run(params).await {
        Ok(resp) => RpcResponse::from_serializable(id, &resp),
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

async fn agent_resume(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let params: ResumeParams = match rpc::parse_params(params) {
        Ok(p) => p,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.service.resume(params).await {
        Ok(resp) => RpcResponse::from_serializable(id, &resp),
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

async fn agent_list(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let params: ListParams = match rpc::parse_params(params) {
        Ok(p) => p,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.service.list(params).await {
        Ok(resp) => RpcResponse::from_serializable(id, &resp),
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

async fn agent_get(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let params: RunIdParams = match rpc::parse_params(params) {
        Ok(p) => p,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.service.get(&params.run_id).await {
        Ok(details) => RpcResponse::from_serializable(id, &details),
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

async fn agent_logs(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let params: RunIdParams = match rpc::parse_params(params) {
        Ok(p) => p,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.service.logs(&params.run_id, params.limit).await {
        Ok(logs) => RpcResponse::from_serializable(id, &logs),
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

async fn agent_wait(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let run: RunIdParams = match rpc::parse_params(params) {
        Ok(p) => p,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let timeout = rpc::optional_u64(params, "timeout_secs").map(Duration::from_secs);
    match state.service.wait(&run.run_id, timeout).await {
        Ok(run) => {
            let terminal = run.is_terminal();
            match serde_json::to_value(&run) {
                Ok(value) => RpcResponse::success(id, json!({ "run": value, "terminal": terminal })),
                Err(e) => RpcResponse::internal_error(id, e.to_string()),
            }
        }
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

// ── Local state ─────────────────────────────────────────────────────

/// Unknown ids return an empty object rather than an error.
fn orchestrator_get(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let params: OrchestratorIdParams = match rpc::parse_params(params) {
        Ok(p) => p,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.service.registry().get_orchestrator(&params.orchestrator_id) {
        Some(record) => RpcResponse::from_serializable(id, &record),
        None => RpcResponse::success(id, json!({})),
    }
}

fn orchestrator_list(state: &HandlerState, id: Option<serde_json::Value>) -> RpcResponse {
    let orchestrators: Vec<_> = state
        .service
        .registry()
        .store()
        .get_all_orchestrators()
        .into_values()
        .collect();
    RpcResponse::from_serializable(id, &json!({ "orchestrators": orchestrators }))
}

fn run_get(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let params: RunIdParams = match rpc::parse_params(params) {
        Ok(p) => p,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.service.registry().get_run(&params.run_id) {
        Some(record) => RpcResponse::from_serializable(id, &record),
        None => RpcResponse::success(id, json!({})),
    }
}

// ── System ──────────────────────────────────────────────────────────

fn health(state: &HandlerState, id: Option<serde_json::Value>) -> RpcResponse {
    let registry = state.service.registry();
    RpcResponse::success(
        id,
        json!({
            "status": "healthy",
            "uptime_secs": state.started_at.elapsed().as_secs(),
            "active_runs": registry.active_runs().len(),
            "completed_runs": registry.completed_runs().len(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_client::MockAgentApi;
    use conductor_core::run::AgentRun;
    use conductor_engine::{CompletionMonitor, MonitorConfig, RunRegistry, ServiceConfig};
    use conductor_store::StateStore;

    struct Fixture {
        _dir: tempfile::TempDir,
        api: Arc<MockAgentApi>,
        state: Arc<HandlerState>,
    }

    fn setup() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(RunRegistry::new(StateStore::open(dir.path()).unwrap()));
        let api = Arc::new(MockAgentApi::new());
        let monitor = Arc::new(CompletionMonitor::new(
            api.clone(),
            registry.clone(),
            MonitorConfig::default(),
        ));
        let service = Arc::new(AgentService::new(
            api.clone(),
            registry,
            monitor,
            ServiceConfig {
                wait_timeout: Duration::from_secs(4),
                wait_poll_interval: Duration::from_secs(1),
            },
        ));
        Fixture {
            _dir: dir,
            api,
            state: Arc::new(HandlerState::new(service)),
        }
    }

    async fn call(state: &Arc<HandlerState>, method: &str, params: serde_json::Value) -> RpcResponse {
        dispatch(state, method, &params, Some(json!(1))).await
    }

    #[tokio::test]
    async fn dispatch_unknown_method() {
        let f = setup();
        let resp = call(&f.state, "foo.bar", json!({})).await;
        assert_eq!(resp.error.as_ref().unwrap().code, "METHOD_NOT_FOUND");
    }

    #[tokio::test]
    async fn agent_new_then_run_get() {
        let f = setup();
        let resp = call(
            &f.state,
            "agent.new",
            json!({"repo": "acme/api", "query": "add pagination", "parentId": 77}),
        )
        .await;
        assert!(resp.success, "{resp:?}");
        let result = resp.result.unwrap();
        assert_eq!(result["status"], "ACTIVE");
        let run_id = result["agent_run_id"].as_str().unwrap().to_string();

        let run = call(&f.state, "run.get", json!({"run_id": run_id})).await;
        let record = run.result.unwrap();
        assert_eq!(record["status"], "running");
        assert_eq!(record["orchestrator_id"], "77");

        let orchestrator = call(&f.state, "orchestrator.get", json!({"orchestrator_id": 77})).await;
        assert_eq!(orchestrator.result.unwrap()["child_runs"], json!([run_id]));
    }

    #[tokio::test]
    async fn agent_new_requires_query() {
        let f = setup();
        let resp = call(&f.state, "agent.new", json!({"repo": "acme/api"})).await;
        assert_eq!(resp.error.unwrap().code, "INVALID_PARAMS");
        assert!(f.api.created().is_empty());
    }

    #[tokio::test]
    async fn upstream_errors_keep_their_kind() {
        let f = setup();
        let resp = call(&f.state, "agent.resume", json!({"agent_run_id": 5, "query": "go"})).await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, "NOT_FOUND");
    }

    #[tokio::test]
    async fn unknown_local_lookups_return_empty_object() {
        let f = setup();
        let run = call(&f.state, "run.get", json!({"run_id": "nonexistent"})).await;
        assert_eq!(run.result.unwrap(), json!({}));
        let orchestrator = call(&f.state, "orchestrator.get", json!({"orchestrator_id": "nope"})).await;
        assert_eq!(orchestrator.result.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn agent_list_returns_runs() {
        let f = setup();
        f.api.insert_run(AgentRun::new(1u64, "ACTIVE"));
        f.api.insert_run(AgentRun::new(2u64, "COMPLETE"));
        let resp = call(&f.state, "agent.list", json!({"limit": 10})).await;
        let runs = resp.result.unwrap()["runs"].as_array().unwrap().len();
        assert_eq!(runs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn agent_wait_reports_non_terminal_on_timeout() {
        let f = setup();
        f.api.insert_run(AgentRun::new(3u64, "ACTIVE"));
        let resp = call(&f.state, "agent.wait", json!({"runId": 3, "timeoutSecs": 2})).await;
        let result = resp.result.unwrap();
        assert_eq!(result["terminal"], false);
        assert_eq!(result["run"]["status"], "ACTIVE");
    }

    #[tokio::test]
    async fn ping_reports_counts() {
        let f = setup();
        f.state
            .service
            .registry()
            .register_run(&RunId::from(1u64), None)
            .unwrap();
        let resp = call(&f.state, "system.ping", json!({})).await;
        let result = resp.result.unwrap();
        assert_eq!(result["status"], "healthy");
        assert_eq!(result["active_runs"], 1);
    }
}
