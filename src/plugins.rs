//! Pipeline plugins
//!
//! A pipeline is wired from three plugin kinds: inputs produce events, filters
//! transform or drop them, outputs ship them. Plugin types are looked up by
//! `(kind, name)` in a [`PluginRegistry`], which also records whether each
//! type can be hot reloaded.

mod filters;
mod generator;
mod outputs;
pub mod registry;
mod stdin;

pub use filters::{DropFilter, GrepFilter, MutateFilter};
pub use generator::GeneratorInput;
pub use outputs::{NullOutput, StdoutOutput};
pub use registry::{PluginInfo, PluginRegistry, ReloadPolicy};
pub use stdin::StdinInput;

use crate::pipeline::event::Event;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{mpsc, watch};

/// Arguments given to a plugin block in the configuration
pub type PluginArgs = serde_json::Map<String, serde_json::Value>;

/// The three plugin kinds a pipeline is built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Input,
    Filter,
    Output,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginKind::Input => "input",
            PluginKind::Filter => "filter",
            PluginKind::Output => "output",
        };
        f.write_str(name)
    }
}

/// Event producer
#[async_trait::async_trait]
pub trait Input: Send {
    /// Produce events until exhausted or until the pipeline stops
    async fn run(&mut self, ctx: InputContext) -> Result<()>;
}

/// Event transformer, shared by every worker of a pipeline
pub trait Filter: Send + Sync {
    /// Apply the filter to an event
    /// Returns true if the event should be kept, false if it should be dropped
    fn filter(&self, event: &mut Event) -> Result<bool>;
}

/// Event consumer, driven by the pipeline's output stage
#[async_trait::async_trait]
pub trait Output: Send {
    /// Write a single event
    async fn write(&mut self, event: &Event) -> Result<()>;

    /// Flush any buffered data
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release resources once the pipeline has drained
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Handle given to an input for pushing events into its pipeline
pub struct InputContext {
    pipeline_id: String,
    sender: mpsc::Sender<Event>,
    shutdown: watch::Receiver<bool>,
}

impl InputContext {
    pub(crate) fn new(
        pipeline_id: impl Into<String>,
        sender: mpsc::Sender<Event>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            sender,
            shutdown,
        }
    }

    /// Id of the pipeline this input feeds
    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// True once the pipeline has been asked to stop
    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Queue an event, waiting for room if the workers are behind
    ///
    /// Returns false once the pipeline is stopping; the input should return.
    pub async fn push(&mut self, event: Event) -> bool {
        if self.is_stopping() {
            return false;
        }

        tokio::select! {
            biased;
            _ = stop_requested(&mut self.shutdown) => false,
            sent = self.sender.send(event) => sent.is_ok(),
        }
    }

    /// Wait until the pipeline is asked to stop
    pub async fn stopped(&mut self) {
        stop_requested(&mut self.shutdown).await;
    }
}

/// Resolves once the shutdown flag is set or its sender is gone
pub(crate) async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Deserialize plugin arguments into a typed configuration
pub fn parse_args<T: DeserializeOwned>(args: &PluginArgs) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(args.clone()))
        .context("Invalid plugin arguments")
}
