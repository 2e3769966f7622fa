//! Reload compatibility check
//!
//! A running pipeline can only be replaced while both instances are briefly
//! alive at once. Plugin types that cannot run twice in one process (the
//! stdin input, for example) block the reload, whether they appear in the
//! running configuration or in the candidate.

use crate::pipeline::config::PipelineDefinition;
use crate::plugins::{PluginKind, ReloadPolicy};
use serde::Serialize;
use std::fmt;

/// A plugin type named by kind and name, displayed as `input/stdin`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PluginRef {
    pub kind: PluginKind,
    pub name: String,
}

impl fmt::Display for PluginRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Compatibility {
    Compatible,
    /// The plugin types that prevent the reload, sorted and deduplicated
    Incompatible { blocking: Vec<PluginRef> },
}

impl Compatibility {
    pub fn is_compatible(&self) -> bool {
        matches!(self, Compatibility::Compatible)
    }
}

/// Decide whether `current` can be replaced by `candidate` under `policy`
pub fn check(
    current: &PipelineDefinition,
    candidate: &PipelineDefinition,
    policy: &dyn ReloadPolicy,
) -> Compatibility {
    let mut blocking: Vec<PluginRef> = current
        .plugins()
        .chain(candidate.plugins())
        .filter(|decl| !policy.is_reloadable(decl.kind, &decl.name))
        .map(|decl| PluginRef {
            kind: decl.kind,
            name: decl.name.clone(),
        })
        .collect();

    if blocking.is_empty() {
        return Compatibility::Compatible;
    }
    blocking.sort();
    blocking.dedup();
    Compatibility::Incompatible { blocking }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PluginRegistry;

    fn parse(text: &str) -> PipelineDefinition {
        PipelineDefinition::parse(text).unwrap()
    }

    #[test]
    fn test_reloadable_plugins_are_compatible() {
        let registry = PluginRegistry::with_builtins();
        let result = check(
            &parse("input { generator {} } output { stdout {} }"),
            &parse("input { generator { count => 1 } } filter { drop {} } output { null {} }"),
            &registry,
        );
        assert!(result.is_compatible());
    }

    #[test]
    fn test_candidate_with_stdin_is_incompatible() {
        let registry = PluginRegistry::with_builtins();
        let result = check(
            &parse("input { generator {} } output { null {} }"),
            &parse("input { stdin {} } output { null {} }"),
            &registry,
        );
        assert_eq!(
            result,
            Compatibility::Incompatible {
                blocking: vec![PluginRef {
                    kind: PluginKind::Input,
                    name: "stdin".to_string()
                }]
            }
        );
    }

    #[test]
    fn test_running_stdin_blocks_and_is_reported_once() {
        let registry = PluginRegistry::with_builtins();
        let result = check(
            &parse("input { stdin {} } output { null {} }"),
            &parse("input { stdin {} generator {} } output { null {} }"),
            &registry,
        );
        match result {
            Compatibility::Incompatible { blocking } => {
                assert_eq!(blocking.len(), 1);
                assert_eq!(blocking[0].to_string(), "input/stdin");
            }
            Compatibility::Compatible => panic!("stdin must block the reload"),
        }
    }

    #[test]
    fn test_policy_is_injected() {
        let policy = |kind: PluginKind, name: &str| !(kind == PluginKind::Output && name == "null");
        let result = check(
            &parse("output { stdout {} }"),
            &parse("output { null {} }"),
            &policy,
        );
        assert!(!result.is_compatible());
    }
}
