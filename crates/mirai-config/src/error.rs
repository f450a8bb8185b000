//! Error types for configuration loading

use thiserror::Error;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur while reading the environment
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is not set
    #[error("required environment variable '{var}' is not set")]
    MissingVar { var: &'static str },

    /// A variable is set but cannot be parsed
    #[error("invalid value for environment variable '{var}': {reason}")]
    InvalidVar { var: &'static str, reason: String },
}
