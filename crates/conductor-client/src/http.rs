use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument};

use conductor_core::api::AgentApi;
use conductor_core::errors::ApiError;
use conductor_core::ids::RunId;
use conductor_core::run::{AgentRun, CreateRunRequest, RunFilter, RunLogs};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection details for the hosted agent service.
#[derive(Debug)]
pub struct HttpApiConfig {
    pub base_url: String,
    pub org_id: String,
    pub token: SecretString,
    pub request_timeout: Duration,
}

/// `AgentApi` over the service's REST endpoints.
pub struct HttpAgentApi {
    client: Client,
    base_url: String,
    org_id: String,
    token: SecretString,
    request_timeout: Duration,
}

/// List responses come back either paginated or as a bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListResponse {
    Page { items: Vec<AgentRun> },
    Bare(Vec<AgentRun>),
}

impl HttpAgentApi {
    pub fn new(config: HttpApiConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::NetworkError(format!("build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            org_id: config.org_id,
            token: config.token,
            request_timeout: config.request_timeout,
        })
    }

    fn org_url(&self, path: &str) -> String {
        format!("{}/v1/organizations/{}{}", self.base_url, self.org_id, path)
    }

    fn alpha_org_url(&self, path: &str) -> String {
        format!("{}/v1/alpha/organizations/{}{}", self.base_url, self.org_id, path)
    }

    /// Send an authenticated request and decode the JSON body.
    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ApiError> {
        let resp = req
            .bearer_auth(self.token.expose_secret())
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::Timeout(self.request_timeout)
                } else {
                    ApiError::NetworkError(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = retry_after(&resp);
            let body = resp.text().await.unwrap_or_default();
            return Err(match ApiError::from_status(status.as_u16(), body) {
                ApiError::RateLimited { .. } => ApiError::RateLimited { retry_after },
                other => other,
            });
        }

        let body = resp
            .text()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// The service expects numeric ids as JSON numbers.
fn id_value(run_id: &RunId) -> serde_json::Value {
    match run_id.as_u64() {
        Some(n) => serde_json::Value::from(n),
        None => serde_json::Value::from(run_id.as_str()),
    }
}

#[async_trait]
impl AgentApi for HttpAgentApi {
    #[instrument(skip(self, request), fields(prompt_len = request.prompt.len()))]
    async fn create_run(&self, request: &CreateRunRequest) -> Result<AgentRun, ApiError> {
        let req = self.client.post(self.org_url("/agent/run")).json(request);
        let run: AgentRun = self.send_json(req).await?;
        debug!(run_id = %run.id, status = %run.status, "run created");
        Ok(run)
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn get_run(&self, run_id: &RunId) -> Result<AgentRun, ApiError> {
        let req = self.client.get(self.org_url(&format!("/agent/run/{run_id}")));
        self.send_json(req).await
    }

    #[instrument(skip(self, prompt), fields(run_id = %run_id))]
    async fn resume_run(&self, run_id: &RunId, prompt: &str) -> Result<AgentRun, ApiError> {
        let body = serde_json::json!({
            "agent_run_id": id_value(run_id),
            "prompt": prompt,
        });
        let req = self.client.post(self.org_url("/agent/run/resume")).json(&body);
        self.send_json(req).await
    }

    #[instrument(skip(self))]
    async fn list_runs(&self, filter: &RunFilter, limit: u32) -> Result<Vec<AgentRun>, ApiError> {
        let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
        if let Some(status) = &filter.status {
            query.push(("status", status.clone()));
        }
        if let Some(repo) = &filter.repo {
            query.push(("repo", repo.clone()));
        }
        let req = self.client.get(self.org_url("/agent/runs")).query(&query);
        let runs = match self.send_json::<ListResponse>(req).await? {
            ListResponse::Page { items } => items,
            ListResponse::Bare(items) => items,
        };
        Ok(runs)
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn get_logs(&self, run_id: &RunId, limit: u32) -> Result<RunLogs, ApiError> {
        let req = self
            .client
            .get(self.alpha_org_url(&format!("/agent/run/{run_id}/logs")))
            .query(&[("limit", limit.to_string())]);
        self.send_json(req).await
    }
}
