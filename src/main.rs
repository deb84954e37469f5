use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use conductor_client::{HttpAgentApi, HttpApiConfig, ReliableAgentApi, ReliableConfig};
use conductor_core::AgentApi;
use conductor_engine::{AgentService, CompletionMonitor, MonitorConfig, RunRegistry, ServiceConfig};
use conductor_server::{HandlerState, ServerConfig};
use conductor_settings::ConductorSettings;
use conductor_store::StateStore;
use conductor_telemetry::{init_telemetry, parse_level, TelemetryConfig};

/// Track hosted agent runs and forward child results to their parents.
#[derive(Debug, Parser)]
#[command(name = "conductor", version)]
struct Args {
    /// Settings file (default: ~/.conductor/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port for the RPC server
    #[arg(long)]
    port: Option<u16>,

    /// Directory holding runs.json and orchestrators.json
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Do not start the background completion monitor
    #[arg(long)]
    no_monitor: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => conductor_settings::load_settings_from_path(path),
        None => conductor_settings::load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(dir) = &args.state_dir {
        settings.state.dir = dir.display().to_string();
    }
    if args.no_monitor {
        settings.monitor.enabled = false;
    }

    let level = parse_level(&settings.logging.level);
    init_telemetry(&TelemetryConfig {
        log_level: level.unwrap_or(Level::INFO),
        module_levels: Vec::new(),
        json: settings.logging.json,
    })?;
    if level.is_none() {
        warn!(level = %settings.logging.level, "unknown log level, using info");
    }

    let api = build_api(&settings)?;

    let state_dir = settings.state.resolved_dir();
    let store = StateStore::open(&state_dir)
        .with_context(|| format!("failed to open state directory {}", state_dir.display()))?;
    let registry = Arc::new(RunRegistry::new(store));
    info!(path = %state_dir.display(), "state opened");

    if settings.state.retention_days > 0 {
        match registry.cleanup_old_runs(settings.state.retention_days) {
            Ok(cleanup) if cleanup.count() > 0 => {
                info!(removed = cleanup.count(), "removed runs past retention");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "retention cleanup failed"),
        }
    }

    let monitor = Arc::new(CompletionMonitor::new(
        Arc::clone(&api),
        Arc::clone(&registry),
        MonitorConfig {
            poll_interval: settings.monitor.poll_interval(),
            forward_results: settings.monitor.forward_results,
            max_concurrent_fetches: settings.monitor.max_concurrent_fetches,
        },
    ));
    let service = Arc::new(AgentService::new(
        api,
        registry,
        Arc::clone(&monitor),
        ServiceConfig {
            wait_timeout: settings.wait.timeout(),
            wait_poll_interval: settings.wait.poll_interval(),
        },
    ));

    let shutdown = CancellationToken::new();
    let monitor_task = if settings.monitor.enabled {
        Some(monitor.start(shutdown.child_token()))
    } else {
        info!("completion monitor disabled");
        None
    };

    let server = conductor_server::start(
        ServerConfig {
            host: settings.server.host.clone(),
            port: settings.server.port,
        },
        Arc::new(HandlerState::new(service)),
        shutdown.clone(),
    )
    .await
    .context("failed to start server")?;
    info!(port = server.port, "conductor ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    info!("shutting down");
    shutdown.cancel();
    server.join().await;
    if let Some(task) = monitor_task {
        let _ = task.await;
    }
    Ok(())
}

/// HTTP client with read retries. Organization id and token are required.
fn build_api(settings: &ConductorSettings) -> anyhow::Result<Arc<dyn AgentApi>> {
    let org_id = settings
        .api
        .org_id
        .clone()
        .context("no organization id configured (set CONDUCTOR_ORG_ID or api.orgId)")?;
    let token = settings
        .api
        .token
        .clone()
        .context("no API token configured (set CONDUCTOR_API_TOKEN or api.token)")?;

    let http = HttpAgentApi::new(HttpApiConfig {
        base_url: settings.api.base_url.clone(),
        org_id,
        token: SecretString::from(token),
        request_timeout: settings.api.request_timeout(),
    })?;
    let reliable = ReliableAgentApi::new(
        http,
        ReliableConfig {
            max_retries: settings.api.max_retries,
            ..Default::default()
        },
    );
    Ok(Arc::new(reliable))
}
