//! Error types for configuration fetching, pipeline construction, and the agent

use crate::plugins::PluginKind;
use std::path::PathBuf;
use thiserror::Error;

/// A setting that failed validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid setting '{key}': {reason}")]
pub struct SettingsError {
    /// Dotted settings key, e.g. `pipeline.workers`
    pub key: &'static str,
    pub reason: String,
}

impl SettingsError {
    pub fn new(key: &'static str, reason: impl Into<String>) -> Self {
        Self {
            key,
            reason: reason.into(),
        }
    }
}

/// Failure to produce configuration text from the configuration source
#[derive(Error, Debug)]
pub enum FetchError {
    /// Neither `config.string` nor `path.config` is set
    #[error("no configuration source: set config.string or path.config")]
    NoSource,

    /// A configuration file or directory could not be read
    #[error("failed to read configuration from {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `${NAME}` references with no value and no default
    #[error("unresolved environment variables in configuration: {}", .0.join(", "))]
    UnresolvedVariables(Vec<String>),

    /// The blocking fetch task was cancelled or panicked
    #[error("configuration fetch task failed: {0}")]
    Task(String),
}

/// Syntax error in pipeline configuration text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}, column {column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// Failure to construct a pipeline from configuration text
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("invalid pipeline configuration: {0}")]
    Parse(#[from] ParseError),

    #[error("unknown {kind} plugin '{name}'")]
    UnknownPlugin { kind: PluginKind, name: String },

    #[error("failed to create {kind} plugin '{name}': {source:#}")]
    Plugin {
        kind: PluginKind,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    InvalidSettings(#[from] SettingsError),

    /// The blocking build task was cancelled or panicked
    #[error("pipeline build task failed: {0}")]
    Task(String),
}

/// Errors surfaced by agent operations
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("pipeline '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("pipeline '{0}' is not registered")]
    UnknownPipeline(String),

    #[error("failed to fetch configuration for pipeline '{id}': {source}")]
    Fetch {
        id: String,
        #[source]
        source: FetchError,
    },

    #[error("failed to build pipeline '{id}': {source}")]
    Build {
        id: String,
        #[source]
        source: BuildError,
    },

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("agent is already executing")]
    AlreadyExecuting,

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_variables_message_lists_names() {
        let err = FetchError::UnresolvedVariables(vec!["FOO".to_string(), "BAR".to_string()]);
        assert_eq!(
            err.to_string(),
            "unresolved environment variables in configuration: FOO, BAR"
        );
    }

    #[test]
    fn test_unknown_plugin_message() {
        let err = BuildError::UnknownPlugin {
            kind: PluginKind::Output,
            name: "elasticsearch".to_string(),
        };
        assert_eq!(err.to_string(), "unknown output plugin 'elasticsearch'");
    }

    #[test]
    fn test_settings_error_converts_into_build_error() {
        let err: BuildError = SettingsError::new("pipeline.workers", "must be at least 1").into();
        assert_eq!(
            err.to_string(),
            "invalid setting 'pipeline.workers': must be at least 1"
        );
    }
}
