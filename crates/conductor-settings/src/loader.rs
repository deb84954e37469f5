//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ConductorSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `CONDUCTOR_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{home_dir, ConductorSettings};

/// Resolve the default settings file (`~/.conductor/settings.json`).
pub fn settings_path() -> PathBuf {
    home_dir().join(".conductor").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ConductorSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or out-of-range values are errors.
pub fn load_settings_from_path(path: &Path) -> Result<ConductorSettings> {
    let mut settings = load_file(path)?;
    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.validate()?;
    Ok(settings)
}

fn load_file(path: &Path) -> Result<ConductorSettings> {
    let defaults = serde_json::to_value(ConductorSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `CONDUCTOR_*` overrides read through `lookup`.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_overrides(settings: &mut ConductorSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── API ─────────────────────────────────────────────────────────
    if let Some(v) = read("CONDUCTOR_API_BASE_URL") {
        settings.api.base_url = v;
    }
    if let Some(v) = read("CONDUCTOR_ORG_ID") {
        settings.api.org_id = Some(v);
    }
    if let Some(v) = read("CONDUCTOR_API_TOKEN") {
        settings.api.token = Some(v);
    }

    // ── State ───────────────────────────────────────────────────────
    if let Some(v) = read("CONDUCTOR_STATE_DIR") {
        settings.state.dir = v;
    }
    if let Some(v) = read("CONDUCTOR_RETENTION_DAYS") {
        if let Some(n) = checked("CONDUCTOR_RETENTION_DAYS", &v, parse_u64_range(&v, 0, 36_500)) {
            settings.state.retention_days = n as u32;
        }
    }

    // ── Monitor ─────────────────────────────────────────────────────
    if let Some(v) = read("CONDUCTOR_POLL_INTERVAL_SECS") {
        if let Some(n) = checked("CONDUCTOR_POLL_INTERVAL_SECS", &v, parse_u64_range(&v, 1, 86_400)) {
            settings.monitor.poll_interval_secs = n;
        }
    }
    if let Some(v) = read("CONDUCTOR_MONITOR_ENABLED") {
        if let Some(b) = checked("CONDUCTOR_MONITOR_ENABLED", &v, parse_bool(&v)) {
            settings.monitor.enabled = b;
        }
    }

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read("CONDUCTOR_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("CONDUCTOR_PORT") {
        if let Some(n) = checked("CONDUCTOR_PORT", &v, parse_u64_range(&v, 1, 65_535)) {
            settings.server.port = n as u16;
        }
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read("CONDUCTOR_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("CONDUCTOR_LOG_JSON") {
        if let Some(b) = checked("CONDUCTOR_LOG_JSON", &v, parse_bool(&v)) {
            settings.logging.json = b;
        }
    }
}

fn checked<T>(key: &str, raw: &str, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "invalid env var, ignoring");
    }
    parsed
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
