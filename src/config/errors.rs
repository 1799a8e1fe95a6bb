//! Configuration errors
//!
//! All configuration errors are FATAL: the engine refuses to start.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::errors::Severity;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } | ConfigError::Write { .. } => "VAULT_CONFIG_IO",
            ConfigError::Parse(_) => "VAULT_CONFIG_PARSE",
            ConfigError::Invalid { .. } => "VAULT_CONFIG_INVALID",
        }
    }

    pub fn severity(&self) -> Severity {
        Severity::Fatal
    }
}
