//! `${NAME}` substitution over composed configuration text
//!
//! Supported forms:
//!
//! - `${NAME}`: value of `NAME`; fails the fetch when `NAME` is unset
//! - `${NAME:default}`: value of `NAME`, or `default` when unset (may be empty)
//!
//! Names follow shell rules: a letter or underscore, then letters, digits, or
//! underscores. Text that does not match the pattern is left alone.

use crate::error::FetchError;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;

static VARIABLE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}")
        .expect("variable pattern is a valid regex")
});

/// Replace every variable reference in `text` using `lookup`
///
/// All unresolved names are collected so the error lists every one of them,
/// in order of first appearance.
pub fn substitute<F>(text: &str, lookup: F) -> Result<String, FetchError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing: Vec<String> = Vec::new();

    let rendered = VARIABLE_PATTERN.replace_all(text, |caps: &Captures| {
        let name = &caps[1];
        match lookup(name).or_else(|| caps.get(2).map(|default| default.as_str().to_string())) {
            Some(value) => value,
            None => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
                String::new()
            }
        }
    });

    if missing.is_empty() {
        Ok(rendered.into_owned())
    } else {
        Err(FetchError::UnresolvedVariables(missing))
    }
}

/// Resolve a name from the overrides first, then the process environment
pub fn lookup_variable(overrides: &HashMap<String, String>, name: &str) -> Option<String> {
    overrides
        .get(name)
        .cloned()
        .or_else(|| std::env::var(name).ok())
}
