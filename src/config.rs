//! Settings for the agent and its pipelines
//!
//! Settings are loaded once from a YAML, JSON, or TOML file, overlaid with
//! command line flags, and handed to each pipeline as an immutable snapshot.
//! Keys use the dotted style of the settings file:
//!
//! ```yaml
//! node.name: edge-01
//! pipeline.id: main
//! path.config: /etc/sluice/conf.d
//! config.reload.automatic: true
//! config.reload.interval: 3
//! pipeline.workers: 4
//! config.environment:
//!   REGION: eu-west-1
//! ```

use crate::error::SettingsError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default interval between automatic reload checks
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(3);
/// Default maximum number of events a worker takes from the queue at once
pub const DEFAULT_BATCH_SIZE: usize = 125;
/// Pipeline id used when none is configured
pub const DEFAULT_PIPELINE_ID: &str = "main";
/// Upper bound for `pipeline.workers`
pub const MAX_PIPELINE_WORKERS: usize = 1024;
/// Upper bound for `pipeline.batch.size`
pub const MAX_BATCH_SIZE: usize = 65_536;

/// Settings snapshot for the agent and a single pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Node name reported by the agent (defaults to the host name)
    #[serde(rename = "node.name", skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Id of the pipeline started by the binary
    #[serde(rename = "pipeline.id")]
    pub pipeline_id: String,
    /// Inline pipeline configuration, placed before any file contents
    #[serde(rename = "config.string", skip_serializing_if = "Option::is_none")]
    pub config_string: Option<String>,
    /// Configuration file, or directory of configuration files
    #[serde(rename = "path.config", skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    /// Periodically re-fetch configuration and reload changed pipelines
    #[serde(rename = "config.reload.automatic")]
    pub reload_automatic: bool,
    /// Interval between automatic reload checks (seconds)
    #[serde(rename = "config.reload.interval", with = "duration_secs")]
    pub reload_interval: Duration,
    /// Number of filter workers per pipeline
    #[serde(rename = "pipeline.workers")]
    pub pipeline_workers: usize,
    /// Maximum events a worker takes from the queue at once
    #[serde(rename = "pipeline.batch.size")]
    pub pipeline_batch_size: usize,
    /// Values for `${NAME}` substitution, consulted before the process environment
    #[serde(rename = "config.environment")]
    pub environment: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node_name: None,
            pipeline_id: DEFAULT_PIPELINE_ID.to_string(),
            config_string: None,
            config_path: None,
            reload_automatic: false,
            reload_interval: DEFAULT_RELOAD_INTERVAL,
            pipeline_workers: default_workers(),
            pipeline_batch_size: DEFAULT_BATCH_SIZE,
            environment: HashMap::new(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(MAX_PIPELINE_WORKERS))
        .unwrap_or(1)
}

impl Settings {
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = Some(name.into());
        self
    }

    pub fn with_pipeline_id(mut self, id: impl Into<String>) -> Self {
        self.pipeline_id = id.into();
        self
    }

    pub fn with_config_string(mut self, config: impl Into<String>) -> Self {
        self.config_string = Some(config.into());
        self
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Enable automatic reload with the given interval
    pub fn with_automatic_reload(mut self, interval: Duration) -> Self {
        self.reload_automatic = true;
        self.reload_interval = interval;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.pipeline_workers = workers;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.pipeline_batch_size = batch_size;
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    /// Check the values a pipeline or the control loop cannot run with
    pub fn validate(&self) -> std::result::Result<(), SettingsError> {
        if self.pipeline_id.trim().is_empty() {
            return Err(SettingsError::new("pipeline.id", "must not be empty"));
        }
        // The queue holds workers × batch size events, so both stay bounded
        if !(1..=MAX_PIPELINE_WORKERS).contains(&self.pipeline_workers) {
            return Err(SettingsError::new(
                "pipeline.workers",
                format!("must be between 1 and {}", MAX_PIPELINE_WORKERS),
            ));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.pipeline_batch_size) {
            return Err(SettingsError::new(
                "pipeline.batch.size",
                format!("must be between 1 and {}", MAX_BATCH_SIZE),
            ));
        }
        if self.reload_automatic && self.reload_interval.is_zero() {
            return Err(SettingsError::new(
                "config.reload.interval",
                "must be greater than 0 when config.reload.automatic is enabled",
            ));
        }
        Ok(())
    }
}

/// Load settings from a file, choosing the format by extension
///
/// `.json` and `.toml` files are parsed as such; anything else is read as YAML.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;

    let settings: Settings = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&contents)
            .with_context(|| format!("Invalid JSON settings in {}", path.display()))?,
        Some("toml") => toml::from_str(&contents)
            .with_context(|| format!("Invalid TOML settings in {}", path.display()))?,
        _ => serde_yaml::from_str(&contents)
            .with_context(|| format!("Invalid YAML settings in {}", path.display()))?,
    };

    Ok(settings)
}

/// Locate the settings file when none is given on the command line
///
/// Precedence: `/etc/sluice/sluice.yml`, then `<user config dir>/sluice/sluice.yml`.
pub fn default_settings_path() -> Option<PathBuf> {
    let system = PathBuf::from("/etc/sluice/sluice.yml");
    if system.exists() {
        return Some(system);
    }

    dirs::config_dir()
        .map(|dir| dir.join("sluice").join("sluice.yml"))
        .filter(|path| path.exists())
}

/// Serde adapter for durations written as (possibly fractional) seconds
mod duration_secs {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.pipeline_id, "main");
        assert!(!settings.reload_automatic);
        assert_eq!(settings.reload_interval, Duration::from_secs(3));
        assert_eq!(settings.pipeline_batch_size, 125);
        assert!(settings.pipeline_workers >= 1);
        assert!(settings.config_string.is_none());
        assert!(settings.config_path.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_yaml_settings() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("sluice.yml");
        fs::write(
            &path,
            r#"
node.name: edge-01
config.string: "input { generator { } }"
config.reload.automatic: true
config.reload.interval: 0.25
pipeline.workers: 4
config.environment:
  REGION: eu-west-1
"#,
        )
        .unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.node_name.as_deref(), Some("edge-01"));
        assert_eq!(settings.pipeline_id, "main");
        assert!(settings.reload_automatic);
        assert_eq!(settings.reload_interval, Duration::from_millis(250));
        assert_eq!(settings.pipeline_workers, 4);
        assert_eq!(settings.environment.get("REGION").unwrap(), "eu-west-1");
    }

    #[test]
    fn test_load_json_settings() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("sluice.json");
        fs::write(
            &path,
            r#"{"pipeline.id": "ingest", "path.config": "/etc/sluice/conf.d", "config.reload.interval": 10}"#,
        )
        .unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.pipeline_id, "ingest");
        assert_eq!(
            settings.config_path,
            Some(PathBuf::from("/etc/sluice/conf.d"))
        );
        assert_eq!(settings.reload_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_load_toml_settings() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("sluice.toml");
        fs::write(
            &path,
            r#"
"pipeline.workers" = 2
"pipeline.batch.size" = 50
"config.reload.automatic" = false
"#,
        )
        .unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.pipeline_workers, 2);
        assert_eq!(settings.pipeline_batch_size, 50);
        assert!(!settings.reload_automatic);
    }

    #[test]
    fn test_negative_interval_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("sluice.yml");
        fs::write(&path, "config.reload.interval: -1\n").unwrap();

        assert!(load_settings(&path).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let err = Settings::default().with_workers(0).validate().unwrap_err();
        assert_eq!(err.key, "pipeline.workers");
    }

    #[test]
    fn test_validate_bounds_workers_and_batch_size() {
        let settings = Settings::default()
            .with_workers(MAX_PIPELINE_WORKERS)
            .with_batch_size(MAX_BATCH_SIZE);
        assert!(settings.validate().is_ok());

        let err = Settings::default()
            .with_workers(MAX_PIPELINE_WORKERS + 1)
            .validate()
            .unwrap_err();
        assert_eq!(err.key, "pipeline.workers");

        let err = Settings::default()
            .with_batch_size(usize::MAX / 2)
            .validate()
            .unwrap_err();
        assert_eq!(err.key, "pipeline.batch.size");
        assert!(err.reason.contains("65536"));
    }

    #[test]
    fn test_oversized_batch_size_in_file_fails_validation() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("sluice.yml");
        fs::write(&path, "pipeline.batch.size: 9223372036854775807\n").unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.validate().unwrap_err().key, "pipeline.batch.size");
    }

    #[test]
    fn test_validate_rejects_zero_interval_with_automatic_reload() {
        let err = Settings::default()
            .with_automatic_reload(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert_eq!(err.key, "config.reload.interval");

        // Interval is irrelevant while automatic reload is off
        let mut settings = Settings::default();
        settings.reload_interval = Duration::ZERO;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let settings = Settings::default()
            .with_node_name("node-a")
            .with_pipeline_id("ingest")
            .with_config_string("input { }")
            .with_workers(3)
            .with_batch_size(10)
            .with_env("FOO", "foo");

        assert_eq!(settings.node_name.as_deref(), Some("node-a"));
        assert_eq!(settings.pipeline_id, "ingest");
        assert_eq!(settings.config_string.as_deref(), Some("input { }"));
        assert_eq!(settings.pipeline_workers, 3);
        assert_eq!(settings.pipeline_batch_size, 10);
        assert_eq!(settings.environment.get("FOO").unwrap(), "foo");
    }
}
