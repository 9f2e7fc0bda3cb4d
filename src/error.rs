//! Crate-wide error type.
//!
//! Instrument drivers use `anyhow` internally to attach context to individual
//! transactions; `ControlError` is the typed surface the application layer
//! (CLI, runners, config loading) matches on.

use thiserror::Error;

/// Result alias used at the application boundary.
pub type AppResult<T> = Result<T, ControlError>;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("Adapter error: {0}")]
    Adapter(#[from] crate::hardware::AdapterError),

    #[error("Session file error: {0}")]
    Session(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Feature '{0}' is not enabled in this build")]
    FeatureNotEnabled(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
