//! Built-in filters
//!
//! Filters run on the pipeline workers and may be shared between them, so
//! they only take `&self`.

use super::{parse_args, Filter, PluginArgs};
use crate::pipeline::event::Event;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Drop filter - discard every event
pub struct DropFilter;

impl Filter for DropFilter {
    fn filter(&self, _event: &mut Event) -> Result<bool> {
        Ok(false)
    }
}

/// Whether a grep match keeps or drops the event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrepMode {
    #[default]
    Include,
    Exclude,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GrepConfig {
    pattern: String,
    #[serde(default)]
    mode: GrepMode,
    #[serde(default = "default_case_sensitive")]
    case_sensitive: bool,
}

fn default_case_sensitive() -> bool {
    true
}

/// Grep filter - keep or drop events whose message matches a regex
pub struct GrepFilter {
    regex: Regex,
    mode: GrepMode,
}

impl GrepFilter {
    /// Create a new grep filter
    pub fn new(pattern: &str, mode: GrepMode, case_sensitive: bool) -> Result<Self> {
        let regex = if case_sensitive {
            Regex::new(pattern)
        } else {
            Regex::new(&format!("(?i){}", pattern))
        }
        .with_context(|| format!("Invalid regex pattern: {}", pattern))?;

        Ok(Self { regex, mode })
    }
}

impl Filter for GrepFilter {
    fn filter(&self, event: &mut Event) -> Result<bool> {
        let matched = self.regex.is_match(&event.message);
        Ok(match self.mode {
            GrepMode::Include => matched,
            GrepMode::Exclude => !matched,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MutateConfig {
    #[serde(default)]
    add_field: Map<String, Value>,
    #[serde(default)]
    uppercase: bool,
    #[serde(default)]
    lowercase: bool,
}

/// Mutate filter - add fields and change the case of the message
pub struct MutateFilter {
    add_field: Map<String, Value>,
    uppercase: bool,
    lowercase: bool,
}

impl MutateFilter {
    pub fn new(add_field: Map<String, Value>, uppercase: bool, lowercase: bool) -> Result<Self> {
        if uppercase && lowercase {
            anyhow::bail!("uppercase and lowercase cannot both be set");
        }
        Ok(Self {
            add_field,
            uppercase,
            lowercase,
        })
    }
}

impl Filter for MutateFilter {
    fn filter(&self, event: &mut Event) -> Result<bool> {
        for (name, value) in &self.add_field {
            event.set_field(name.clone(), value.clone());
        }

        if self.uppercase {
            event.message = event.message.to_uppercase();
        } else if self.lowercase {
            event.message = event.message.to_lowercase();
        }

        Ok(true)
    }
}

pub fn create_drop_filter(args: &PluginArgs) -> Result<Box<dyn Filter>> {
    if let Some(name) = args.keys().next() {
        anyhow::bail!("drop filter takes no arguments, got '{}'", name);
    }
    Ok(Box::new(DropFilter))
}

pub fn create_grep_filter(args: &PluginArgs) -> Result<Box<dyn Filter>> {
    let config: GrepConfig = parse_args(args)?;
    Ok(Box::new(GrepFilter::new(
        &config.pattern,
        config.mode,
        config.case_sensitive,
    )?))
}

pub fn create_mutate_filter(args: &PluginArgs) -> Result<Box<dyn Filter>> {
    let config: MutateConfig = parse_args(args)?;
    Ok(Box::new(MutateFilter::new(
        config.add_field,
        config.uppercase,
        config.lowercase,
    )?))
}
