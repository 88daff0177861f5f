//! Configuration resolution for pushsub.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/pushsub/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::dispatch::Priority;
use crate::error::{Error, Result};

/// Complete pushsub configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub hub: HubConfig,
}

/// Retry escalation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Retry counts above this stop retrying and suspend or terminate.
    pub max_retries: u32,
    /// Inactivity (days since last renewal) beyond which an exhausted
    /// subscriber is terminated instead of suspended.
    pub terminate_after_inactive_days: i64,
    /// Upper bound of the per-attempt jitter factor.
    pub jitter_max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: 14,
            terminate_after_inactive_days: 60,
            jitter_max_secs: 30,
        }
    }
}

/// Hub process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    /// Seconds between due-set scans.
    pub requeue_interval_secs: u64,
    /// Seconds between pruning passes over terminated subscribers.
    pub prune_interval_secs: u64,
    /// Terminated subscribers not renewed for this many days are deleted.
    pub prune_after_days: i64,
    /// Priority for first attempts after a publish.
    pub default_priority: Priority,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            log_level: "info".to_string(),
            requeue_interval_secs: 60,
            prune_interval_secs: 3600,
            prune_after_days: 30,
            default_priority: Priority::High,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();

    // Global config is optional
    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            layers.push(global_path);
        }
    }

    // A missing explicit config is an error
    if let Some(path) = explicit {
        layers.push(path.to_path_buf());
    }

    let mut config = load_layers(&layers)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.json"))
}

/// Default database path for the hub.
pub fn database_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("hub.db"))
}

fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".pushsub"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/pushsub"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("pushsub"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Deep-merge config files in order, later files winning per key, then
/// decode the result over the built-in defaults.
fn load_layers<P: AsRef<Path>>(paths: &[P]) -> Result<Config> {
    let mut merged = Value::Object(Map::new());
    for path in paths {
        merge_json(&mut merged, read_config_value(path.as_ref())?);
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))
}

fn load_config_file(path: &Path) -> Result<Config> {
    load_layers(&[path])
}

fn read_config_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    if !value.is_object() {
        return Err(Error::Config(format!(
            "Failed to parse config file {}: top level must be an object",
            path.display()
        )));
    }
    Ok(value)
}

/// Overlay `overlay` onto `base`. Objects merge key by key, anything else
/// replaces.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(n) = var("PUSHSUB_MAX_RETRIES").and_then(|v| v.parse().ok()) {
        config.backoff.max_retries = n;
    }
    if let Some(n) = var("PUSHSUB_TERMINATE_AFTER_DAYS").and_then(|v| v.parse().ok()) {
        config.backoff.terminate_after_inactive_days = n;
    }
    if let Some(path) = var("PUSHSUB_DB_PATH") {
        config.hub.database_path = Some(PathBuf::from(path));
    }
    if let Some(val) = var("PUSHSUB_LOG_LEVEL") {
        config.hub.log_level = val;
    }
    if let Some(n) = var("PUSHSUB_REQUEUE_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
        config.hub.requeue_interval_secs = n;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_backoff_matches_escalation_limits() {
        let config = Config::default();
        assert_eq!(config.backoff.max_retries, 14);
        assert_eq!(config.backoff.terminate_after_inactive_days, 60);
        assert_eq!(config.backoff.jitter_max_secs, 30);
    }

    #[test]
    fn default_hub_requeues_every_minute() {
        let config = Config::default();
        assert_eq!(config.hub.requeue_interval_secs, 60);
        assert_eq!(config.hub.default_priority, Priority::High);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"backoff":{"max_retries":5},"hub":{"prune_after_days":7}}"#)
            .unwrap();

        let loaded = load_config_file(&path).unwrap();
        assert_eq!(loaded.backoff.max_retries, 5);
        assert_eq!(loaded.backoff.terminate_after_inactive_days, 60);
        assert_eq!(loaded.hub.prune_after_days, 7);
        assert_eq!(loaded.hub.requeue_interval_secs, 60);
    }

    #[test]
    fn unreadable_file_is_config_error() {
        let err = load_config_file(Path::new("/nonexistent/pushsub.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_config_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PUSHSUB_MAX_RETRIES", "3"),
            ("PUSHSUB_DB_PATH", "/tmp/hub.db"),
            ("PUSHSUB_REQUEUE_INTERVAL_SECS", "not-a-number"),
        ]);
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(ToString::to_string));

        assert_eq!(config.backoff.max_retries, 3);
        assert_eq!(config.hub.database_path, Some(PathBuf::from("/tmp/hub.db")));
        assert_eq!(config.hub.requeue_interval_secs, 60);
    }

    #[test]
    fn explicit_file_only_overrides_the_keys_it_names() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("settings.json");
        let explicit = dir.path().join("hub.json");
        std::fs::write(
            &global,
            r#"{"backoff":{"max_retries":5},"hub":{"prune_after_days":7,"database_path":"/var/lib/pushsub/hub.db"}}"#,
        )
        .unwrap();
        std::fs::write(&explicit, r#"{"hub":{"log_level":"debug","prune_after_days":9}}"#).unwrap();

        let config = load_layers(&[&global, &explicit]).unwrap();
        assert_eq!(config.backoff.max_retries, 5);
        assert_eq!(config.backoff.jitter_max_secs, 30);
        assert_eq!(config.hub.log_level, "debug");
        assert_eq!(config.hub.prune_after_days, 9);
        assert_eq!(config.hub.requeue_interval_secs, 60);
        assert_eq!(
            config.hub.database_path,
            Some(PathBuf::from("/var/lib/pushsub/hub.db"))
        );
    }

    #[test]
    fn no_layers_gives_defaults() {
        let config = load_layers::<&Path>(&[]).unwrap();
        assert_eq!(config.backoff, BackoffConfig::default());
        assert_eq!(config.hub.log_level, "info");
    }

    #[test]
    fn wrongly_typed_value_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"backoff":{"max_retries":"many"}}"#).unwrap();
        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.starts_with("Invalid configuration")));
    }

    #[test]
    fn non_object_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(load_config_file(&path).unwrap_err(), Error::Config(_)));
    }
}
