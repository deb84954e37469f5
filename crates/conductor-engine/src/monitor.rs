use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use conductor_core::api::AgentApi;
use conductor_core::errors::ApiError;
use conductor_core::ids::RunId;
use conductor_core::run::AgentRun;

use crate::error::EngineError;
use crate::registry::RunRegistry;

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Resume the parent with a child's result when the child finishes.
    pub forward_results: bool,
    pub max_concurrent_fetches: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            forward_results: true,
            max_concurrent_fetches: 8,
        }
    }
}

/// Outcome of one monitoring pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub checked: usize,
    pub completed: usize,
    pub forwarded: usize,
    pub failed_fetches: usize,
    pub failed_forwards: usize,
}

/// Polls active runs and completes the ones the remote reports as terminal.
pub struct CompletionMonitor {
    api: Arc<dyn AgentApi>,
    registry: Arc<RunRegistry>,
    config: MonitorConfig,
}

impl CompletionMonitor {
    pub fn new(api: Arc<dyn AgentApi>, registry: Arc<RunRegistry>, config: MonitorConfig) -> Self {
        Self {
            api,
            registry,
            config,
        }
    }

    /// One pass: retry undelivered results, then poll the active set.
    ///
    /// Fetches run concurrently. A failed fetch or forward only affects that
    /// run and is retried on the next pass.
    pub async fn monitor_agent_runs(&self) -> MonitorReport {
        let active = self.registry.active_runs();
        let mut report = MonitorReport {
            checked: active.len(),
            ..Default::default()
        };

        if self.config.forward_results {
            for child in self.registry.pending_forwards() {
                match self.redeliver(&child).await {
                    Ok(Some(_)) => report.forwarded += 1,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(run_id = %child, error = %e, "forward retry failed");
                        report.failed_forwards += 1;
                    }
                }
            }
        }
        if active.is_empty() {
            return report;
        }

        let fetched: Vec<_> = stream::iter(active)
            .map(|run_id| async move {
                let result = self.api.get_run(&run_id).await;
                (run_id, result)
            })
            .buffer_unordered(self.config.max_concurrent_fetches.max(1))
            .collect()
            .await;

        for (run_id, result) in fetched {
            match result {
                Ok(run) if run.is_terminal() => match self.handle_completed_run(&run).await {
                    Ok(outcome) => {
                        report.completed += usize::from(outcome.newly_completed);
                        report.forwarded += usize::from(outcome.forwarded_to.is_some());
                    }
                    Err(e) => {
                        warn!(run_id = %run_id, error = %e, "failed to forward result to parent");
                        report.completed += 1;
                        report.failed_forwards += 1;
                    }
                },
                Ok(run) => debug!(run_id = %run_id, status = %run.status, "run still active"),
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "failed to fetch run status");
                    report.failed_fetches += 1;
                }
            }
        }
        report
    }

    /// Complete `run` locally and, the first time only, forward its result
    /// to its parent by resuming the parent.
    ///
    /// The run is flagged as owing its result before the forward starts. An
    /// error here leaves the flag set and the next pass retries the forward.
    #[instrument(skip_all, fields(run_id = %run.id, status = %run.status))]
    pub async fn handle_completed_run(&self, run: &AgentRun) -> Result<Completion, EngineError> {
        let newly_completed = if self.config.forward_results {
            self.registry
                .complete_child_run(&run.id, run.run_status(), run.result.clone())
        } else {
            self.registry
                .complete_run(&run.id, run.run_status(), run.result.clone())
        };
        let mut outcome = Completion {
            newly_completed,
            forwarded_to: None,
        };
        if !newly_completed {
            debug!("run already completed, nothing to forward");
            return Ok(outcome);
        }
        info!("run completed");

        if !self.config.forward_results {
            return Ok(outcome);
        }
        outcome.forwarded_to = self.forward(run).await?;
        Ok(outcome)
    }

    /// Fetch a finished child again and forward its result.
    async fn redeliver(&self, child: &RunId) -> Result<Option<RunId>, EngineError> {
        match self.api.get_run(child).await {
            Ok(run) => self.forward(&run).await,
            Err(e) => Err(self.give_up_unless_retryable(child, e.into())),
        }
    }

    /// Resume the parent of `run` with its result and clear the pending flag.
    async fn forward(&self, run: &AgentRun) -> Result<Option<RunId>, EngineError> {
        let Some(parent) = self.registry.parent_of(&run.id) else {
            let _ = self.registry.forward_delivered(&run.id);
            return Ok(None);
        };

        match self.resume_parent(&parent, run).await {
            Ok(_) => {
                let _ = self.registry.forward_delivered(&run.id);
                info!(run_id = %run.id, parent = %parent, "forwarded result to parent");
                Ok(Some(parent))
            }
            Err(e) => Err(self.give_up_unless_retryable(&run.id, e.into())),
        }
    }

    async fn resume_parent(&self, parent: &RunId, run: &AgentRun) -> Result<AgentRun, ApiError> {
        let parent_run = self.api.get_run(parent).await?;
        if parent_run.is_terminal() {
            debug!(parent = %parent, parent_status = %parent_run.status, "parent already finished, resuming anyway");
        }
        self.api.resume_run(parent, &forward_prompt(run)).await
    }

    /// Errors that will not go away on their own (unknown run, bad
    /// credentials) end the retries for `child`; the rest keep it pending.
    fn give_up_unless_retryable(&self, child: &RunId, error: EngineError) -> EngineError {
        if let EngineError::Api(api) = &error {
            if !api.is_retryable() {
                error!(run_id = %child, error = %error, "dropping result forward");
                let _ = self.registry.forward_delivered(child);
            }
        }
        error
    }

    /// Run [`Self::monitor_agent_runs`] on an interval until `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?self.config.poll_interval, "completion monitor started");
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    report = self.monitor_agent_runs() => {
                        if report.completed > 0 || report.failed_fetches > 0 || report.failed_forwards > 0 {
                            info!(
                                checked = report.checked,
                                completed = report.completed,
                                forwarded = report.forwarded,
                                failed_fetches = report.failed_fetches,
                                failed_forwards = report.failed_forwards,
                                "monitor pass"
                            );
                        }
                    }
                }
            }
            info!("completion monitor stopped");
        })
    }
}

/// What [`CompletionMonitor::handle_completed_run`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub newly_completed: bool,
    pub forwarded_to: Option<RunId>,
}

/// Message sent to a parent run when one of its children finishes.
pub fn forward_prompt(run: &AgentRun) -> String {
    let mut prompt = format!(
        "Child agent run {} finished with status {}.",
        run.id,
        run.run_status()
    );
    if let Some(url) = &run.web_url {
        prompt.push_str(&format!("\nDetails: {url}"));
    }
    prompt.push_str("\n\nResult:\n");
    prompt.push_str(run.result.as_deref().unwrap_or("(no result reported)"));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_client::MockAgentApi;
    use conductor_core::run::{CreateRunRequest, RunFilter, RunLogs};
    use conductor_core::status::RunStatus;
    use conductor_store::StateStore;

    struct Fixture {
        _dir: tempfile::TempDir,
        api: Arc<MockAgentApi>,
        registry: Arc<RunRegistry>,
        monitor: CompletionMonitor,
    }

    fn fixture(config: MonitorConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(RunRegistry::new(StateStore::open(dir.path()).unwrap()));
        let api = Arc::new(MockAgentApi::new());
        let monitor = CompletionMonitor::new(api.clone(), registry.clone(), config);
        Fixture {
            _dir: dir,
            api,
            registry,
            monitor,
        }
    }

    fn id(raw: u64) -> RunId {
        RunId::from(raw)
    }

    #[tokio::test]
    async fn completed_child_result_is_forwarded_to_parent() {
        let f = fixture(MonitorConfig::default());
        let (orchestrator, child) = (id(100), id(101));
        f.api.insert_run(AgentRun::new(orchestrator.clone(), "ACTIVE"));
        f.api.insert_run(AgentRun::new(child.clone(), "ACTIVE"));
        f.registry.register_parent_child(&orchestrator, &child, None).unwrap();

        f.api.set_status(&child, "COMPLETE", Some("done"));
        let finished = AgentRun::new(child.clone(), "completed").with_result("done");
        let outcome = f.monitor.handle_completed_run(&finished).await.unwrap();

        assert!(outcome.newly_completed);
        assert_eq!(outcome.forwarded_to, Some(orchestrator.clone()));
        assert!(!f.registry.is_active(&child));
        assert!(f.registry.is_completed(&child));

        let resumes = f.api.resumes();
        assert_eq!(resumes.len(), 1);
        assert_eq!(resumes[0].0, orchestrator);
        assert!(resumes[0].1.contains("101"));
        assert!(resumes[0].1.contains("done"));

        let record = f.registry.get_run(&child).unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.result.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn second_observation_does_not_forward_again() {
        let f = fixture(MonitorConfig::default());
        f.api.insert_run(AgentRun::new(id(1), "ACTIVE"));
        f.registry.register_parent_child(&id(1), &id(2), None).unwrap();
        let finished = AgentRun::new(id(2), "COMPLETE").with_result("ok");

        f.monitor.handle_completed_run(&finished).await.unwrap();
        let again = f.monitor.handle_completed_run(&finished).await.unwrap();

        assert!(!again.newly_completed);
        assert_eq!(f.api.resumes().len(), 1);
    }

    #[tokio::test]
    async fn forwarding_can_be_disabled() {
        let f = fixture(MonitorConfig {
            forward_results: false,
            ..Default::default()
        });
        f.api.insert_run(AgentRun::new(id(1), "ACTIVE"));
        f.registry.register_parent_child(&id(1), &id(2), None).unwrap();

        let outcome = f
            .monitor
            .handle_completed_run(&AgentRun::new(id(2), "ERROR"))
            .await
            .unwrap();
        assert!(outcome.newly_completed);
        assert!(outcome.forwarded_to.is_none());
        assert!(f.api.resumes().is_empty());
        assert_eq!(f.registry.get_run(&id(2)).unwrap().status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn pass_isolates_per_run_failures() {
        let f = fixture(MonitorConfig::default());
        for n in 1..=3 {
            f.api.insert_run(AgentRun::new(id(n), "ACTIVE"));
            f.registry.register_run(&id(n), None).unwrap();
        }
        f.api.set_status(&id(1), "COMPLETE", Some("first"));
        f.api.fail_get(
            &id(2),
            vec![ApiError::ServerError {
                status: 500,
                body: String::new(),
            }],
        );

        let report = f.monitor.monitor_agent_runs().await;
        assert_eq!(
            report,
            MonitorReport {
                checked: 3,
                completed: 1,
                failed_fetches: 1,
                ..Default::default()
            }
        );
        assert_eq!(f.registry.active_runs(), vec![id(2), id(3)]);

        f.api.set_status(&id(2), "COMPLETE", None);
        let report = f.monitor.monitor_agent_runs().await;
        assert_eq!(report.completed, 1);
        assert_eq!(f.registry.active_runs(), vec![id(3)]);
    }

    #[tokio::test]
    async fn failed_forward_is_retried_next_pass() {
        let f = fixture(MonitorConfig::default());
        f.api.insert_run(AgentRun::new(id(1), "ACTIVE"));
        f.api.insert_run(AgentRun::new(id(2), "ACTIVE"));
        f.registry.register_parent_child(&id(1), &id(2), None).unwrap();
        f.api.set_status(&id(2), "COMPLETE", Some("done"));
        f.api.fail_resume(ApiError::ServerError {
            status: 503,
            body: "unavailable".into(),
        });

        let first = f.monitor.monitor_agent_runs().await;
        assert_eq!(
            first,
            MonitorReport {
                checked: 1,
                completed: 1,
                failed_forwards: 1,
                ..Default::default()
            }
        );
        assert!(f.registry.is_completed(&id(2)));
        assert!(f.registry.get_run(&id(2)).unwrap().forward_pending);
        assert!(f.api.resumes().is_empty());

        let second = f.monitor.monitor_agent_runs().await;
        assert_eq!(second.checked, 0);
        assert_eq!(second.forwarded, 1);
        let resumes = f.api.resumes();
        assert_eq!(resumes.len(), 1);
        assert_eq!(resumes[0].0, id(1));
        assert!(resumes[0].1.contains("done"));
        assert!(f.registry.pending_forwards().is_empty());

        let third = f.monitor.monitor_agent_runs().await;
        assert_eq!(third, MonitorReport::default());
        assert_eq!(f.api.resumes().len(), 1);
    }

    #[tokio::test]
    async fn pending_forward_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockAgentApi::new());
        api.insert_run(AgentRun::new(id(1), "ACTIVE"));
        api.insert_run(AgentRun::new(id(2), "COMPLETE").with_result("late"));
        {
            let registry = Arc::new(RunRegistry::new(StateStore::open(dir.path()).unwrap()));
            registry.register_parent_child(&id(1), &id(2), None).unwrap();
            let monitor = CompletionMonitor::new(api.clone(), registry, MonitorConfig::default());
            api.fail_resume(ApiError::NetworkError("reset".into()));
            let report = monitor.monitor_agent_runs().await;
            assert_eq!(report.failed_forwards, 1);
        }

        let registry = Arc::new(RunRegistry::new(StateStore::open(dir.path()).unwrap()));
        let monitor = CompletionMonitor::new(api.clone(), registry.clone(), MonitorConfig::default());
        let report = monitor.monitor_agent_runs().await;
        assert_eq!(report.forwarded, 1);
        assert_eq!(api.resumes().len(), 1);
        assert!(api.resumes()[0].1.contains("late"));
    }

    #[tokio::test]
    async fn forward_to_unknown_parent_is_dropped() {
        let f = fixture(MonitorConfig::default());
        f.registry.register_parent_child(&id(1), &id(2), None).unwrap();
        f.api.insert_run(AgentRun::new(id(2), "COMPLETE"));

        let report = f.monitor.monitor_agent_runs().await;
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed_forwards, 1);
        assert!(f.registry.is_completed(&id(2)));
        assert!(f.registry.pending_forwards().is_empty());

        let report = f.monitor.monitor_agent_runs().await;
        assert_eq!(report, MonitorReport::default());
        assert!(f.api.resumes().is_empty());
    }

    /// Holds every `get_run` until a permit is released.
    struct GatedApi {
        inner: Arc<MockAgentApi>,
        entered: tokio::sync::Notify,
        release: tokio::sync::Semaphore,
    }

    impl GatedApi {
        fn new(inner: Arc<MockAgentApi>) -> Self {
            Self {
                inner,
                entered: tokio::sync::Notify::new(),
                release: tokio::sync::Semaphore::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl AgentApi for GatedApi {
        async fn create_run(&self, request: &CreateRunRequest) -> Result<AgentRun, ApiError> {
            self.inner.create_run(request).await
        }

        async fn get_run(&self, run_id: &RunId) -> Result<AgentRun, ApiError> {
            self.entered.notify_one();
            self.release.acquire().await.unwrap().forget();
            self.inner.get_run(run_id).await
        }

        async fn resume_run(&self, run_id: &RunId, prompt: &str) -> Result<AgentRun, ApiError> {
            self.inner.resume_run(run_id, prompt).await
        }

        async fn list_runs(&self, filter: &RunFilter, limit: u32) -> Result<Vec<AgentRun>, ApiError> {
            self.inner.list_runs(filter, limit).await
        }

        async fn get_logs(&self, run_id: &RunId, limit: u32) -> Result<RunLogs, ApiError> {
            self.inner.get_logs(run_id, limit).await
        }
    }

    type Gated = (
        tempfile::TempDir,
        Arc<MockAgentApi>,
        Arc<GatedApi>,
        Arc<RunRegistry>,
        Arc<CompletionMonitor>,
    );

    fn gated_fixture() -> Gated {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(RunRegistry::new(StateStore::open(dir.path()).unwrap()));
        let mock = Arc::new(MockAgentApi::new());
        let api = Arc::new(GatedApi::new(mock.clone()));
        let monitor = Arc::new(CompletionMonitor::new(
            api.clone(),
            registry.clone(),
            MonitorConfig::default(),
        ));
        (dir, mock, api, registry, monitor)
    }

    #[tokio::test]
    async fn registration_during_pass_is_kept() {
        let (_dir, mock, api, registry, monitor) = gated_fixture();
        mock.insert_run(AgentRun::new(id(1), "ACTIVE"));
        mock.insert_run(AgentRun::new(id(2), "ACTIVE"));
        registry.register_run(&id(1), None).unwrap();

        let pass = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.monitor_agent_runs().await }
        });
        api.entered.notified().await;
        registry.register_parent_child(&id(1), &id(2), None).unwrap();
        api.release.add_permits(1);

        let report = pass.await.unwrap();
        assert_eq!(report.checked, 1);
        assert!(registry.is_active(&id(2)));
        assert_eq!(registry.parent_of(&id(2)), Some(id(1)));

        mock.set_status(&id(2), "COMPLETE", Some("late"));
        api.release.add_permits(16);
        let report = monitor.monitor_agent_runs().await;
        assert_eq!(report.checked, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(report.forwarded, 1);
        assert!(registry.is_completed(&id(2)));
    }

    #[tokio::test]
    async fn interrupted_forward_resumes_next_pass() {
        let (_dir, mock, api, registry, monitor) = gated_fixture();
        mock.insert_run(AgentRun::new(id(1), "ACTIVE"));
        mock.insert_run(AgentRun::new(id(2), "COMPLETE").with_result("ok"));
        registry.register_parent_child(&id(1), &id(2), None).unwrap();

        let finished = AgentRun::new(id(2), "COMPLETE").with_result("ok");
        // dropped while waiting on the parent fetch, as a cancelled pass would be
        tokio::select! {
            biased;
            _ = monitor.handle_completed_run(&finished) => panic!("forward should be blocked"),
            () = api.entered.notified() => {}
        }
        assert!(registry.is_completed(&id(2)));
        assert_eq!(registry.pending_forwards(), vec![id(2)]);
        assert!(mock.resumes().is_empty());

        api.release.add_permits(16);
        let report = monitor.monitor_agent_runs().await;
        assert_eq!(report.forwarded, 1);
        assert_eq!(mock.resumes().len(), 1);
        assert!(registry.pending_forwards().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn background_task_polls_until_cancelled() {
        let f = fixture(MonitorConfig {
            poll_interval: Duration::from_secs(10),
            ..Default::default()
        });
        f.api.insert_run(AgentRun::new(id(5), "ACTIVE"));
        f.registry.register_run(&id(5), None).unwrap();
        f.api.script_statuses(&id(5), &["ACTIVE", "COMPLETE"]);

        let Fixture {
            _dir,
            api,
            registry,
            monitor,
        } = f;
        let cancel = CancellationToken::new();
        let handle = Arc::new(monitor).start(cancel.clone());

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(registry.is_completed(&id(5)));
        assert_eq!(api.get_calls(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn forward_prompt_mentions_child_and_result() {
        let run = AgentRun::new(42u64, "ERROR").with_web_url("https://app.test/runs/42");
        let prompt = forward_prompt(&run);
        assert!(prompt.contains("42"));
        assert!(prompt.contains("failed"));
        assert!(prompt.contains("https://app.test/runs/42"));
        assert!(prompt.contains("(no result reported)"));
    }
}
