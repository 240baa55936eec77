use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Problems with the autopace config file, always tied to the file's path.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("{path} is not valid autopace TOML: {source}")]
    Syntax {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{path}: [{section}] {field} {reason}")]
    Invalid {
        path: PathBuf,
        section: &'static str,
        field: &'static str,
        reason: String,
    },
}

impl ConfigError {
    /// `section.field` of the rejected value, if this is a validation failure.
    pub fn invalid_field(&self) -> Option<String> {
        match self {
            ConfigError::Invalid { section, field, .. } => Some(format!("{section}.{field}")),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
