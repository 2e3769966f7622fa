//! Plugin registry
//!
//! Maps a `(kind, name)` pair to a constructor and a reloadable flag. The
//! registry is an explicit value handed to the agent rather than a global, so
//! tests and embedders can add their own plugin types next to the built-ins.

use super::{
    filters, generator, outputs, stdin, Filter, Input, Output, PluginArgs, PluginKind,
};
use crate::error::BuildError;
use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

type InputConstructor = Arc<dyn Fn(&PluginArgs) -> Result<Box<dyn Input>> + Send + Sync>;
type FilterConstructor = Arc<dyn Fn(&PluginArgs) -> Result<Box<dyn Filter>> + Send + Sync>;
type OutputConstructor = Arc<dyn Fn(&PluginArgs) -> Result<Box<dyn Output>> + Send + Sync>;

#[derive(Clone)]
enum Constructor {
    Input(InputConstructor),
    Filter(FilterConstructor),
    Output(OutputConstructor),
}

// Registry entry containing the constructor and metadata
#[derive(Clone)]
struct PluginRegistryEntry {
    constructor: Constructor,
    reloadable: bool,
    description: String,
}

/// Description of a registered plugin type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    pub kind: PluginKind,
    pub name: String,
    pub description: String,
    pub reloadable: bool,
}

/// Capability-keyed registry of plugin types
#[derive(Clone, Default)]
pub struct PluginRegistry {
    entries: HashMap<(PluginKind, String), PluginRegistryEntry>,
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in plugins
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register_input(
            "generator",
            "Generate events from a fixed message or list of lines",
            true,
            generator::create_generator_input,
        );
        // Two instances would compete for the same process stdin
        registry.register_input(
            "stdin",
            "Read one event per line from standard input",
            false,
            stdin::create_stdin_input,
        );

        registry.register_filter(
            "drop",
            "Drop every event",
            true,
            filters::create_drop_filter,
        );
        registry.register_filter(
            "grep",
            "Keep or drop events whose message matches a regex",
            true,
            filters::create_grep_filter,
        );
        registry.register_filter(
            "mutate",
            "Add fields and change the case of the message",
            true,
            filters::create_mutate_filter,
        );

        registry.register_output(
            "stdout",
            "Write events to standard output",
            true,
            outputs::create_stdout_output,
        );
        registry.register_output(
            "null",
            "Discard every event",
            true,
            outputs::create_null_output,
        );

        registry
    }

    /// Register an input type, replacing any previous one with the same name
    pub fn register_input<F>(&mut self, name: &str, description: &str, reloadable: bool, constructor: F)
    where
        F: Fn(&PluginArgs) -> Result<Box<dyn Input>> + Send + Sync + 'static,
    {
        self.insert(
            PluginKind::Input,
            name,
            description,
            reloadable,
            Constructor::Input(Arc::new(constructor)),
        );
    }

    /// Register a filter type, replacing any previous one with the same name
    pub fn register_filter<F>(&mut self, name: &str, description: &str, reloadable: bool, constructor: F)
    where
        F: Fn(&PluginArgs) -> Result<Box<dyn Filter>> + Send + Sync + 'static,
    {
        self.insert(
            PluginKind::Filter,
            name,
            description,
            reloadable,
            Constructor::Filter(Arc::new(constructor)),
        );
    }

    /// Register an output type, replacing any previous one with the same name
    pub fn register_output<F>(&mut self, name: &str, description: &str, reloadable: bool, constructor: F)
    where
        F: Fn(&PluginArgs) -> Result<Box<dyn Output>> + Send + Sync + 'static,
    {
        self.insert(
            PluginKind::Output,
            name,
            description,
            reloadable,
            Constructor::Output(Arc::new(constructor)),
        );
    }

    fn insert(
        &mut self,
        kind: PluginKind,
        name: &str,
        description: &str,
        reloadable: bool,
        constructor: Constructor,
    ) {
        let entry = PluginRegistryEntry {
            constructor,
            reloadable,
            description: description.to_string(),
        };
        self.entries.insert((kind, name.to_string()), entry);
    }

    pub fn contains(&self, kind: PluginKind, name: &str) -> bool {
        self.entries.contains_key(&(kind, name.to_string()))
    }

    /// Reloadable flag of a registered type, `None` if the type is unknown
    pub fn reloadable(&self, kind: PluginKind, name: &str) -> Option<bool> {
        self.entries
            .get(&(kind, name.to_string()))
            .map(|entry| entry.reloadable)
    }

    /// Every registered type, sorted by kind then name
    pub fn describe(&self) -> Vec<PluginInfo> {
        let mut plugins: Vec<PluginInfo> = self
            .entries
            .iter()
            .map(|((kind, name), entry)| PluginInfo {
                kind: *kind,
                name: name.clone(),
                description: entry.description.clone(),
                reloadable: entry.reloadable,
            })
            .collect();
        plugins.sort_by(|a, b| (a.kind, &a.name).cmp(&(b.kind, &b.name)));
        plugins
    }

    pub fn build_input(&self, name: &str, args: &PluginArgs) -> Result<Box<dyn Input>, BuildError> {
        match self.constructor(PluginKind::Input, name)? {
            Constructor::Input(constructor) => {
                constructor(args).map_err(|source| plugin_error(PluginKind::Input, name, source))
            }
            _ => Err(unknown(PluginKind::Input, name)),
        }
    }

    pub fn build_filter(&self, name: &str, args: &PluginArgs) -> Result<Box<dyn Filter>, BuildError> {
        match self.constructor(PluginKind::Filter, name)? {
            Constructor::Filter(constructor) => {
                constructor(args).map_err(|source| plugin_error(PluginKind::Filter, name, source))
            }
            _ => Err(unknown(PluginKind::Filter, name)),
        }
    }

    pub fn build_output(&self, name: &str, args: &PluginArgs) -> Result<Box<dyn Output>, BuildError> {
        match self.constructor(PluginKind::Output, name)? {
            Constructor::Output(constructor) => {
                constructor(args).map_err(|source| plugin_error(PluginKind::Output, name, source))
            }
            _ => Err(unknown(PluginKind::Output, name)),
        }
    }

    fn constructor(&self, kind: PluginKind, name: &str) -> Result<&Constructor, BuildError> {
        self.entries
            .get(&(kind, name.to_string()))
            .map(|entry| &entry.constructor)
            .ok_or_else(|| unknown(kind, name))
    }
}

fn unknown(kind: PluginKind, name: &str) -> BuildError {
    BuildError::UnknownPlugin {
        kind,
        name: name.to_string(),
    }
}

fn plugin_error(kind: PluginKind, name: &str, source: anyhow::Error) -> BuildError {
    BuildError::Plugin {
        kind,
        name: name.to_string(),
        source,
    }
}

/// Decides whether a plugin type may take part in a hot reload
pub trait ReloadPolicy: Send + Sync {
    fn is_reloadable(&self, kind: PluginKind, name: &str) -> bool;
}

impl ReloadPolicy for PluginRegistry {
    // Unknown types pass here and are rejected when the candidate is built
    fn is_reloadable(&self, kind: PluginKind, name: &str) -> bool {
        self.reloadable(kind, name).unwrap_or(true)
    }
}

impl<F> ReloadPolicy for F
where
    F: Fn(PluginKind, &str) -> bool + Send + Sync,
{
    fn is_reloadable(&self, kind: PluginKind, name: &str) -> bool {
        self(kind, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event::Event;

    struct UppercaseFilter;

    impl Filter for UppercaseFilter {
        fn filter(&self, event: &mut Event) -> Result<bool> {
            event.message = event.message.to_uppercase();
            Ok(true)
        }
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = PluginRegistry::with_builtins();
        assert!(registry.contains(PluginKind::Input, "generator"));
        assert!(registry.contains(PluginKind::Input, "stdin"));
        assert!(registry.contains(PluginKind::Filter, "drop"));
        assert!(registry.contains(PluginKind::Filter, "grep"));
        assert!(registry.contains(PluginKind::Filter, "mutate"));
        assert!(registry.contains(PluginKind::Output, "stdout"));
        assert!(registry.contains(PluginKind::Output, "null"));
        assert!(!registry.contains(PluginKind::Output, "generator"));
    }

    #[test]
    fn test_stdin_is_not_reloadable() {
        let registry = PluginRegistry::with_builtins();
        assert_eq!(registry.reloadable(PluginKind::Input, "stdin"), Some(false));
        assert_eq!(registry.reloadable(PluginKind::Input, "generator"), Some(true));
        assert_eq!(registry.reloadable(PluginKind::Input, "kafka"), None);

        assert!(!registry.is_reloadable(PluginKind::Input, "stdin"));
        assert!(registry.is_reloadable(PluginKind::Input, "kafka"));
    }

    #[test]
    fn test_register_custom_filter() {
        let mut registry = PluginRegistry::new();
        registry.register_filter("upcase", "Uppercase the message", true, |_args| {
            Ok(Box::new(UppercaseFilter) as Box<dyn Filter>)
        });

        let filter = registry.build_filter("upcase", &PluginArgs::new()).unwrap();
        let mut event = Event::new("quiet");
        assert!(filter.filter(&mut event).unwrap());
        assert_eq!(event.message, "QUIET");
    }

    #[test]
    fn test_build_unknown_plugin_fails() {
        let registry = PluginRegistry::with_builtins();
        let err = registry
            .build_output("elasticsearch", &PluginArgs::new())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BuildError::UnknownPlugin { kind: PluginKind::Output, ref name } if name == "elasticsearch"
        ));
    }

    #[test]
    fn test_build_with_bad_arguments_fails() {
        let registry = PluginRegistry::with_builtins();
        let mut args = PluginArgs::new();
        args.insert("count".to_string(), serde_json::json!("many"));
        let err = registry.build_input("generator", &args).err().unwrap();
        assert!(matches!(err, BuildError::Plugin { kind: PluginKind::Input, .. }));
    }

    #[test]
    fn test_describe_is_sorted() {
        let registry = PluginRegistry::with_builtins();
        let names: Vec<(PluginKind, String)> = registry
            .describe()
            .into_iter()
            .map(|info| (info.kind, info.name))
            .collect();
        assert_eq!(names.first().unwrap(), &(PluginKind::Input, "generator".to_string()));
        assert_eq!(names.last().unwrap(), &(PluginKind::Output, "stdout".to_string()));
        assert_eq!(names.len(), 7);
    }

    #[test]
    fn test_closure_reload_policy() {
        let policy = |kind: PluginKind, name: &str| !(kind == PluginKind::Output && name == "tcp");
        assert!(policy.is_reloadable(PluginKind::Input, "tcp"));
        assert!(!policy.is_reloadable(PluginKind::Output, "tcp"));
    }
}
