//! Settings type definitions.
//!
//! Field names are camelCase on the wire. Every section is `#[serde(default)]`
//! so a partial JSON file only overrides what it names.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConductorSettings {
    pub api: ApiSettings,
    pub state: StateSettings,
    pub monitor: MonitorSettings,
    pub wait: WaitSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

impl ConductorSettings {
    /// Reject values that would make the tracker spin or never poll.
    pub fn validate(&self) -> Result<()> {
        if self.monitor.poll_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "monitor.pollIntervalSecs must be at least 1".into(),
            ));
        }
        if self.wait.poll_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "wait.pollIntervalSecs must be at least 1".into(),
            ));
        }
        if self.monitor.max_concurrent_fetches == 0 {
            return Err(SettingsError::InvalidValue(
                "monitor.maxConcurrentFetches must be at least 1".into(),
            ));
        }
        if self.api.base_url.trim().is_empty() {
            return Err(SettingsError::InvalidValue("api.baseUrl is empty".into()));
        }
        Ok(())
    }
}

/// Remote agent service connection.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSettings {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub request_timeout_secs: u64,
    /// Retries for idempotent reads. Writes are never retried.
    pub max_retries: u32,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.codegen.com".to_string(),
            org_id: None,
            token: None,
            request_timeout_secs: 60,
            max_retries: 3,
        }
    }
}

impl ApiSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl fmt::Debug for ApiSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiSettings")
            .field("base_url", &self.base_url)
            .field("org_id", &self.org_id)
            .field("token", &self.token.as_ref().map(|_| "[redacted]"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Where run/orchestrator documents live.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateSettings {
    /// State directory. A leading `~/` expands to `$HOME`.
    pub dir: String,
    /// Runs older than this are purged at startup. `0` disables cleanup.
    pub retention_days: u32,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            dir: "~/.conductor/state".to_string(),
            retention_days: 30,
        }
    }
}

impl StateSettings {
    pub fn resolved_dir(&self) -> PathBuf {
        expand_home(&self.dir)
    }
}

/// Background completion monitor.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorSettings {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    /// Resume the parent run with each child's result.
    pub forward_results: bool,
    pub max_concurrent_fetches: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 30,
            forward_results: true,
            max_concurrent_fetches: 8,
        }
    }
}

impl MonitorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Defaults for callers that block until a run finishes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WaitSettings {
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            poll_interval_secs: 5,
        }
    }
}

impl WaitSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None if path == "~" => home_dir(),
        None => PathBuf::from(path),
    }
}

pub(crate) fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
