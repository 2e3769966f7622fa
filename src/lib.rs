//! Sluice - pipeline supervisor agent with live configuration reload
//!
//! The [`agent::Agent`] owns named event pipelines, keeps each one in step with
//! its configuration source, and swaps in a new instance when the configuration
//! changes, without a restart and without resetting metrics.

pub mod agent;
pub mod compat;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod plugins;
pub mod registry;
pub mod source;

pub use agent::{Agent, AgentBuilder, PipelineStatus, ReloadOutcome};
pub use config::Settings;
pub use error::{AgentError, BuildError, FetchError, ParseError, SettingsError};
pub use metrics::{MetricSnapshot, MetricsCollector};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineState};
