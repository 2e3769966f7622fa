//! Generator input
//!
//! Emits a fixed message (or each of a list of lines in turn) a set number of
//! times, or until the pipeline stops when `count` is 0. Every event carries a
//! `sequence` field with the zero-based round it was produced in.
//!
//! ```text
//! input {
//!   generator {
//!     lines => ["first", "second"]
//!     count => 10
//!   }
//! }
//! ```

use super::{parse_args, Input, InputContext, PluginArgs};
use crate::pipeline::event::Event;
use anyhow::Result;
use serde::Deserialize;
use tracing::debug;

/// Generator input configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorConfig {
    /// Message used when no lines are given
    #[serde(default = "default_message")]
    pub message: String,
    /// Lines emitted in order on every round
    #[serde(default)]
    pub lines: Vec<String>,
    /// Number of rounds; 0 runs until the pipeline stops
    #[serde(default)]
    pub count: u64,
}

fn default_message() -> String {
    "Hello world!".to_string()
}

/// Input that generates synthetic events
pub struct GeneratorInput {
    config: GeneratorConfig,
}

impl GeneratorInput {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    fn lines(&self) -> Vec<String> {
        if self.config.lines.is_empty() {
            vec![self.config.message.clone()]
        } else {
            self.config.lines.clone()
        }
    }
}

#[async_trait::async_trait]
impl Input for GeneratorInput {
    async fn run(&mut self, mut ctx: InputContext) -> Result<()> {
        let lines = self.lines();
        let mut sequence: u64 = 0;

        while self.config.count == 0 || sequence < self.config.count {
            for line in &lines {
                let event = Event::new(line.clone()).with_field("sequence", sequence);
                if !ctx.push(event).await {
                    debug!(
                        pipeline = ctx.pipeline_id(),
                        sequence, "generator stopped by pipeline shutdown"
                    );
                    return Ok(());
                }
            }
            sequence += 1;
        }

        debug!(
            pipeline = ctx.pipeline_id(),
            rounds = sequence,
            "generator finished"
        );
        Ok(())
    }
}

/// Create a generator input from plugin arguments
pub fn create_generator_input(args: &PluginArgs) -> Result<Box<dyn Input>> {
    let config: GeneratorConfig = parse_args(args)?;
    Ok(Box::new(GeneratorInput::new(config)))
}
