//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `RELAY_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use relay_core::LogFormat;
use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::RelaySettings;

/// Resolve the path to the settings file (`~/.relay/settings.json`).
///
/// `RELAY_SETTINGS` overrides the location.
pub fn settings_path() -> PathBuf {
    if let Some(p) = read_env_string("RELAY_SETTINGS") {
        return PathBuf::from(p);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or an invalid merged value
/// is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: RelaySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
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

/// Apply environment variable overrides to loaded settings.
///
/// Integers must parse and fall within range; booleans accept
/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`. Invalid values are
/// logged and ignored.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("RELAY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u64("RELAY_PORT", 0, 65_535) {
        #[allow(clippy::cast_possible_truncation)]
        let port = v as u16;
        settings.server.port = port;
    }
    if let Some(v) = read_env_u64("RELAY_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = usize::try_from(v).unwrap_or(usize::MAX);
    }
    if let Some(v) = read_env_u64("RELAY_HEARTBEAT_INTERVAL_SECS", 1, 3_600) {
        settings.server.heartbeat_interval_secs = v;
    }

    // ── Emitter ─────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("RELAY_MAX_EVENTS_PER_USER", 1, 1_000_000) {
        settings.emitter.max_events_per_user = usize::try_from(v).unwrap_or(usize::MAX);
    }
    if let Some(v) = read_env_u64("RELAY_DELIVERY_RETRIES", 1, 100) {
        #[allow(clippy::cast_possible_truncation)]
        let retries = v as u32;
        settings.emitter.delivery_retries = retries;
    }
    if let Some(v) = read_env_u64("RELAY_DELIVERY_TIMEOUT_MS", 1, 600_000) {
        settings.emitter.delivery_timeout_ms = v;
    }

    // ── Recovery ────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("RELAY_CIRCUIT_BREAKER_THRESHOLD", 1, 1_000) {
        #[allow(clippy::cast_possible_truncation)]
        let threshold = v as u32;
        settings.recovery.circuit_breaker_threshold = threshold;
    }
    if let Some(v) = read_env_bool("RELAY_GRACEFUL_DEGRADATION") {
        settings.recovery.enable_graceful_degradation = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("RELAY_LOG_JSON") {
        settings.logging.format = if v { LogFormat::Json } else { LogFormat::Compact };
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

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

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, min, max, "invalid integer env var, ignoring");
    }
    result
}
