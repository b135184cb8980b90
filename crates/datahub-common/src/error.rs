//! Error types shared across the datahub crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, DatahubError>;

/// Error raised by shared types and configuration loading
#[derive(Error, Debug)]
pub enum DatahubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid period '{0}': expected YYYY-MM-DD, YYYY-MM, YYYYQn or YYYY")]
    InvalidPeriod(String),

    #[error("Invalid series key '{0}': keys are non-empty and use [A-Za-z0-9_-]")]
    InvalidSeriesKey(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DatahubError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
