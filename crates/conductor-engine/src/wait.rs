use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use conductor_core::api::AgentApi;
use conductor_core::errors::ApiError;
use conductor_core::ids::RunId;
use conductor_core::run::AgentRun;

/// Poll `run_id` until it reaches a terminal state or `timeout` elapses.
///
/// One remote fetch per iteration, with a cooperative sleep in between. On
/// timeout the last observed state is returned as `Ok`; callers check the
/// status to tell completion from timeout. Local state is never touched.
///
/// Retryable fetch errors are logged and polling continues. A non-retryable
/// error, or a timeout with nothing ever observed, returns the error.
pub async fn wait_for_completion(
    api: &dyn AgentApi,
    run_id: &RunId,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<AgentRun, ApiError> {
    let deadline = Instant::now() + timeout;
    let poll_interval = poll_interval.max(Duration::from_millis(1));
    let mut last_seen: Option<AgentRun> = None;
    let mut last_error: Option<ApiError> = None;

    loop {
        match api.get_run(run_id).await {
            Ok(run) if run.is_terminal() => {
                debug!(run_id = %run_id, status = %run.status, "run reached terminal state");
                return Ok(run);
            }
            Ok(run) => last_seen = Some(run),
            Err(e) if e.is_retryable() => {
                warn!(run_id = %run_id, error = %e, "status poll failed, will retry");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }

    debug!(run_id = %run_id, ?timeout, "wait timed out");
    match (last_seen, last_error) {
        (Some(run), _) => Ok(run),
        (None, Some(e)) => Err(e),
        (None, None) => Err(ApiError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_client::MockAgentApi;

    fn server_error() -> ApiError {
        ApiError::ServerError {
            status: 502,
            body: String::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_returns_last_observed_state() {
        let api = MockAgentApi::new();
        let run_id = RunId::from(1u64);
        api.insert_run(AgentRun::new(run_id.clone(), "ACTIVE"));

        let start = Instant::now();
        let run = wait_for_completion(&api, &run_id, Duration::from_secs(2), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(run.status, "ACTIVE");
        assert!(!run.is_terminal());
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(api.get_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_as_soon_as_terminal() {
        let api = MockAgentApi::new();
        let run_id = RunId::from(2u64);
        api.insert_run(AgentRun::new(run_id.clone(), "PENDING"));
        api.script_statuses(&run_id, &["ACTIVE", "ACTIVE", "COMPLETE"]);

        let start = Instant::now();
        let run = wait_for_completion(&api, &run_id, Duration::from_secs(60), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(run.status, "COMPLETE");
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_do_not_end_the_wait() {
        let api = MockAgentApi::new();
        let run_id = RunId::from(3u64);
        api.insert_run(AgentRun::new(run_id.clone(), "FAILED"));
        api.fail_get(&run_id, vec![server_error(), server_error()]);

        let run = wait_for_completion(&api, &run_id, Duration::from_secs(30), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(run.status, "FAILED");
    }

    #[tokio::test(start_paused = true)]
    async fn only_errors_observed_returns_error() {
        let api = MockAgentApi::new();
        let run_id = RunId::from(4u64);
        api.insert_run(AgentRun::new(run_id.clone(), "ACTIVE"));
        api.fail_get(&run_id, (0..10).map(|_| server_error()).collect());

        let err = wait_for_completion(&api, &run_id, Duration::from_secs(2), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_run_fails_fast() {
        let api = MockAgentApi::new();
        let err = wait_for_completion(
            &api,
            &RunId::from("missing"),
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert_eq!(api.get_calls(), 1);
    }
}
