use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use conductor_core::api::AgentApi;
use conductor_core::errors::ApiError;
use conductor_core::ids::RunId;
use conductor_core::run::{AgentRun, CreateRunRequest, RunFilter, RunLogs};

/// Retry behavior for [`ReliableAgentApi`].
#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
            jitter_factor: 0.2,
        }
    }
}

/// Wraps an `AgentApi` with retries for idempotent reads.
///
/// - `get_run`, `list_runs` and `get_logs` retry retryable errors with exponential backoff + jitter
/// - `retry_after` hints from rate limit responses are respected
/// - `create_run` and `resume_run` are passed through once; a retried write could start a duplicate run
pub struct ReliableAgentApi<A: AgentApi> {
    inner: A,
    config: ReliableConfig,
    total_retries: AtomicU64,
}

impl<A: AgentApi> ReliableAgentApi<A> {
    pub fn new(inner: A, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: A) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Exponential backoff: base * 2^attempt, capped, with ±jitter.
    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }

        let exp_delay = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(self.config.max_delay.as_millis() as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(1.0) as u64)
    }

    async fn with_retries<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ApiError>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.retry_delay(attempt, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);

                    warn!(
                        op,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after error"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<A: AgentApi> AgentApi for ReliableAgentApi<A> {
    async fn create_run(&self, request: &CreateRunRequest) -> Result<AgentRun, ApiError> {
        self.inner.create_run(request).await
    }

    async fn get_run(&self, run_id: &RunId) -> Result<AgentRun, ApiError> {
        self.with_retries("get_run", move || self.inner.get_run(run_id)).await
    }

    async fn resume_run(&self, run_id: &RunId, prompt: &str) -> Result<AgentRun, ApiError> {
        self.inner.resume_run(run_id, prompt).await
    }

    async fn list_runs(&self, filter: &RunFilter, limit: u32) -> Result<Vec<AgentRun>, ApiError> {
        self.with_retries("list_runs", move || self.inner.list_runs(filter, limit))
            .await
    }

    async fn get_logs(&self, run_id: &RunId, limit: u32) -> Result<RunLogs, ApiError> {
        self.with_retries("get_logs", move || self.inner.get_logs(run_id, limit))
            .await
    }
}
