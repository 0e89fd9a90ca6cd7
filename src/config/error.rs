//! Configuration error types.

use thiserror::Error;

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Could not read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Could not parse the YAML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value failed validation.
    #[error("invalid config: {0}")]
    Invalid(String),
}
