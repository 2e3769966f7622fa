//! Configuration source
//!
//! Produces the pipeline configuration text for a settings snapshot: the inline
//! `config.string` first, then the contents of `path.config`, then `${NAME}`
//! substitution over the whole text.

pub mod template;

use crate::config::Settings;
use crate::error::FetchError;
use std::fs;
use std::path::Path;

/// Supplies the current configuration text for a pipeline
pub trait ConfigSource: Send + Sync {
    /// Fetch the composed, substituted configuration text
    fn fetch(&self, settings: &Settings) -> Result<String, FetchError>;
}

/// Reads `config.string` and `path.config` from the local host
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalConfigSource;

impl ConfigSource for LocalConfigSource {
    fn fetch(&self, settings: &Settings) -> Result<String, FetchError> {
        let composed = compose(settings)?;
        template::substitute(&composed, |name| {
            template::lookup_variable(&settings.environment, name)
        })
    }
}

/// Concatenate the inline string and the configured file contents
fn compose(settings: &Settings) -> Result<String, FetchError> {
    if settings.config_string.is_none() && settings.config_path.is_none() {
        return Err(FetchError::NoSource);
    }

    let mut text = settings.config_string.clone().unwrap_or_default();
    if let Some(path) = &settings.config_path {
        text.push_str(&read_path(path)?);
    }
    Ok(text)
}

/// Read a single file, or every regular file in a directory in name order
fn read_path(path: &Path) -> Result<String, FetchError> {
    let metadata = fs::metadata(path).map_err(|source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    if !metadata.is_dir() {
        return read_file(path);
    }

    let entries = fs::read_dir(path).map_err(|source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| FetchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file_path = entry.path();
        if file_path.is_file() {
            files.push(file_path);
        }
    }
    files.sort();

    let mut text = String::new();
    for file in files {
        text.push_str(&read_file(&file)?);
    }
    Ok(text)
}

fn read_file(path: &Path) -> Result<String, FetchError> {
    fs::read_to_string(path).map_err(|source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    })
}
