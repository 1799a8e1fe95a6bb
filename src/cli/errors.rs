//! CLI error types
//!
//! Every CLI error ends the invocation with a non-zero exit. Engine errors
//! keep their own `VAULT_*` code so scripts can match on it.

use std::io;
use std::path::Path;

use thiserror::Error;

use crate::config::ConfigError;
use crate::errors::VaultError;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("config {0} already exists")]
    AlreadyInitialized(String),

    #[error("config {0} not found; run `seqvault init` first")]
    NotInitialized(String),

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Engine(#[from] VaultError),
}

impl CliError {
    pub fn already_initialized(path: &Path) -> Self {
        CliError::AlreadyInitialized(path.display().to_string())
    }

    pub fn not_initialized(path: &Path) -> Self {
        CliError::NotInitialized(path.display().to_string())
    }

    pub fn code_str(&self) -> &'static str {
        match self {
            CliError::AlreadyInitialized(_) => "VAULT_CLI_ALREADY_INITIALIZED",
            CliError::NotInitialized(_) => "VAULT_CLI_NOT_INITIALIZED",
            CliError::Config(_) => "VAULT_CLI_CONFIG_ERROR",
            CliError::Io(_) | CliError::Json(_) => "VAULT_CLI_IO_ERROR",
            CliError::Engine(e) => e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Sequence;

    #[test]
    fn test_engine_error_keeps_code() {
        let err: CliError = VaultError::invalid_range(Sequence::new(5), Sequence::new(2), "backwards").into();
        assert_eq!(err.code_str(), "VAULT_INVALID_RANGE");
        assert!(err.to_string().starts_with("invalid sequence range"));
    }

    #[test]
    fn test_not_initialized_names_path() {
        let err = CliError::not_initialized(Path::new("/tmp/vault.json"));
        assert_eq!(err.code_str(), "VAULT_CLI_NOT_INITIALIZED");
        assert!(err.to_string().contains("/tmp/vault.json"));
    }
}
